//! Logging (C7). Grounded on the teacher's own `fern`-based dispatcher:
//! one `log`-facade sink, chained to stdout and/or a date-rolled file
//! depending on the `-d`/`-l` flags.

use std::fs::{create_dir_all, metadata};
use std::path::Path;

use anyhow::Result;
use fern::{DateBased, Dispatch};

use crate::cli::Args;

pub const DEFAULT_LOG_DIR: &str = "/var/log/ttdnsd";

pub fn init(args: &Args) -> Result<()> {
    let level = if args.debug {
        log::LevelFilter::Trace
    } else {
        log::LevelFilter::Info
    };

    let mut logger = Dispatch::new()
        .level(level)
        .format(move |out, message, record| {
            out.finish(format_args!(
                "[{}] - ({}) - {}",
                record.level(),
                record.file_static().unwrap_or("*"),
                message
            ))
        });

    if args.debug || !args.log_file {
        logger = logger.chain(std::io::stdout());
    }

    if args.log_file {
        let dir = Path::new(DEFAULT_LOG_DIR);
        if metadata(dir).is_err() {
            create_dir_all(dir)?;
        }

        logger = logger.chain(DateBased::new(dir, "ttdnsd-%Y-%m-%d.log"));
    }

    logger.apply()?;

    Ok(())
}
