//! # Antler Node Executable
//!
//! The standalone node process of the antler harness. A parent node (or the
//! controller) launches this executable with a single positional argument,
//! the node id, and speaks the typed message protocol over its stdio:
//! stdout carries messages to the parent, stdin carries messages from it,
//! and stderr is reserved for logging, which the parent forwards line by
//! line into its own log.
//!
//! The process serves its parent connection until `Final` has been seen in
//! both directions, then exits 0 on a clean drain and 1 when serving
//! returned an error. An interrupt cancels the process context, which
//! drains the node cleanly: buffered records are flushed upward before the
//! terminal message.

use antler::cli::Args;
use antler::node::{Ctx, Node};
use antler::transport::Transport;
use antler::{logging, repo};
use clap::Parser;
use tracing::{debug, error};

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let _log_guard = logging::init(args.verbose, args.log_file.as_deref());

    // A node executable is its own source for its platform, letting it
    // launch same-platform children without an embedded image.
    repo::self_init();

    let (cancel, ctx) = Ctx::new();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    debug!(
        "antler node {} starting (version {}, platform {})",
        args.id,
        antler::VERSION,
        repo::platform()
    );

    let transport = Transport::from_io(tokio::io::stdin(), tokio::io::stdout());
    let mut node = Node::new(&args.id);
    if let Some(grace) = args.grace {
        node = node.with_grace(grace);
    }

    match node.serve(transport, ctx).await {
        Ok(()) => debug!("node {} done", args.id),
        Err(e) => {
            error!("node {}: {:#}", args.id, e);
            std::process::exit(1);
        }
    }
}
