//! # Node Executable Command Line
//!
//! The standalone node executable takes a single positional argument, the
//! node id assigned by its parent, attaches stdio as the parent transport,
//! and serves until the connection sees `Final` in both directions. Stderr
//! is reserved for logging, which the parent forwards line by line into its
//! own log.
//!
//! Duration arguments accept human-readable forms: `250ms`, `10s`, `5m`,
//! `1h`, with fractional values allowed (`1.5s`).

use clap::Parser;
use std::time::Duration;

/// Antler node executable: serves one node of a distributed network test
/// over stdio.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Node id assigned by the parent
    pub id: String,

    /// Increase log verbosity (-v: debug, -vv: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Also write a detailed rolling log to this file
    #[arg(long)]
    pub log_file: Option<String>,

    /// Grace period between cancel and forced child teardown
    #[arg(long, value_parser = parse_duration)]
    pub grace: Option<Duration>,
}

/// Parse a human-readable duration: a number with an optional `ms`, `s`,
/// `m`, or `h` suffix (seconds when no suffix is given).
///
/// The string splits at the first alphabetic character into a value and a
/// unit; the unit indexes a seconds-per-unit table.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    const UNITS: [(&str, f64); 5] = [
        ("ms", 1e-3),
        ("s", 1.0),
        ("m", 60.0),
        ("h", 3600.0),
        ("", 1.0),
    ];

    let s = s.trim();
    let split = s.find(|c: char| c.is_ascii_alphabetic()).unwrap_or(s.len());
    let (value_str, unit) = s.split_at(split);
    let scale = UNITS
        .iter()
        .find(|(u, _)| *u == unit)
        .map(|(_, scale)| *scale)
        .ok_or_else(|| format!("unknown duration unit {:?} in {:?}", unit, s))?;
    let value: f64 = value_str
        .parse()
        .map_err(|_| format!("bad duration value {:?} in {:?}", value_str, s))?;
    if !value.is_finite() || value < 0.0 {
        return Err(format!("duration {:?} must be finite and non-negative", s));
    }
    Ok(Duration::from_secs_f64(value * scale))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_each_unit() {
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        // No suffix means seconds.
        assert_eq!(parse_duration("3").unwrap(), Duration::from_secs(3));
    }

    #[test]
    fn parses_fractional_values() {
        assert_eq!(parse_duration("1.5s").unwrap(), Duration::from_millis(1500));
        assert_eq!(parse_duration("0.5m").unwrap(), Duration::from_secs(30));
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("fast").is_err());
        assert!(parse_duration("-1s").is_err());
        assert!(parse_duration("1x").is_err());
    }

    #[test]
    fn args_parse_id_and_flags() {
        let args = Args::try_parse_from(["antler-node", "n3", "-vv", "--grace", "2s"]).unwrap();
        assert_eq!(args.id, "n3");
        assert_eq!(args.verbose, 2);
        assert_eq!(args.grace, Some(Duration::from_secs(2)));
    }

    #[test]
    fn args_require_an_id() {
        assert!(Args::try_parse_from(["antler-node"]).is_err());
    }
}
