//! Command-line argument processing. We accept a small subset of what GNU ld accepts, with both
//! single and double dash spellings for flags.

use crate::error::Result;
use anyhow::bail;
use anyhow::Context;
use std::path::PathBuf;

pub(crate) struct Args {
    pub(crate) output: PathBuf,
    pub(crate) is_static: bool,
    pub(crate) filler: Option<u8>,
    pub(crate) thread_count: Option<usize>,
    pub(crate) trace: bool,
    pub(crate) trace_symbols: Vec<String>,
    pub(crate) print_map: bool,
    pub(crate) stat: bool,
    pub(crate) inputs: Vec<PathBuf>,
}

impl Args {
    pub(crate) fn from_env() -> Result<Args> {
        Args::parse(std::env::args().skip(1))
    }

    pub(crate) fn parse<I: Iterator<Item = String>>(mut input: I) -> Result<Args> {
        let mut output = None;
        let mut is_static = false;
        let mut filler = None;
        let mut thread_count = None;
        let mut trace = false;
        let mut trace_symbols = Vec::new();
        let mut print_map = false;
        let mut stat = false;
        let mut inputs = Vec::new();

        let mut take_value = |input: &mut I, flag: &str| -> Result<String> {
            input
                .next()
                .with_context(|| format!("{flag}: missing argument"))
        };

        while let Some(arg) = input.next() {
            // Flags may be spelled with one or two dashes.
            let flag = arg
                .strip_prefix("--")
                .or_else(|| arg.strip_prefix('-'))
                .unwrap_or(&arg);
            if !arg.starts_with('-') {
                inputs.push(PathBuf::from(arg));
                continue;
            }
            match flag {
                "o" => output = Some(PathBuf::from(take_value(&mut input, "-o")?)),
                "static" => is_static = true,
                "filler" => filler = Some(parse_filler(&take_value(&mut input, "-filler")?)?),
                "thread-count" => {
                    let value = take_value(&mut input, "-thread-count")?;
                    let n: usize = value.parse().unwrap_or(0);
                    if n == 0 {
                        bail!("-thread-count: expected a positive integer, but got '{value}'");
                    }
                    thread_count = Some(n);
                }
                "trace" => trace = true,
                "trace-symbol" => trace_symbols.push(take_value(&mut input, "-trace-symbol")?),
                "print-map" => print_map = true,
                "stat" => stat = true,
                _ => bail!("unknown argument '{arg}'"),
            }
        }

        let Some(output) = output else {
            bail!("-o option is missing");
        };
        if inputs.is_empty() {
            bail!("no input files");
        }
        Ok(Args {
            output,
            is_static,
            filler,
            thread_count,
            trace,
            trace_symbols,
            print_map,
            stat,
            inputs,
        })
    }

    pub(crate) fn setup_thread_pool(&self) -> Result {
        if let Some(n) = self.thread_count {
            rayon::ThreadPoolBuilder::new()
                .num_threads(n)
                .build_global()?;
        }
        Ok(())
    }
}

fn parse_filler(value: &str) -> Result<u8> {
    let Some(hex) = value.strip_prefix("0x") else {
        bail!("invalid argument: -filler {value}");
    };
    u8::from_str_radix(hex, 16).with_context(|| format!("invalid argument: -filler {value}"))
}

pub(crate) fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Args> {
        Args::parse(args.iter().map(|s| s.to_string()))
    }

    #[test]
    fn test_basic() {
        let args = parse(&["-o", "out", "a.o", "b.o"]).unwrap();
        assert_eq!(args.output, PathBuf::from("out"));
        assert_eq!(args.inputs.len(), 2);
        assert!(!args.is_static);
    }

    #[test]
    fn test_flags() {
        let args = parse(&[
            "-static",
            "-o",
            "out",
            "-filler",
            "0xcc",
            "-thread-count",
            "4",
            "-trace-symbol",
            "main",
            "a.o",
        ])
        .unwrap();
        assert!(args.is_static);
        assert_eq!(args.filler, Some(0xcc));
        assert_eq!(args.thread_count, Some(4));
        assert_eq!(args.trace_symbols, ["main"]);
    }

    #[test]
    fn test_errors() {
        assert!(parse(&["a.o"]).is_err());
        assert!(parse(&["-o", "out"]).is_err());
        assert!(parse(&["-o", "out", "-bogus", "a.o"]).is_err());
        assert!(parse(&["-o", "out", "-filler", "cc", "a.o"]).is_err());
        assert!(parse(&["-o", "out", "-thread-count", "0", "a.o"]).is_err());
        assert!(parse(&["-o", "out", "-thread-count", "x", "a.o"]).is_err());
    }
}
