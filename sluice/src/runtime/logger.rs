use std::path::Path;
use std::str::FromStr;

use log::LevelFilter;
use log::LevelFilter::Warn;
use log4rs::append::console::{ConsoleAppender, Target};
use log4rs::append::rolling_file::policy::compound::roll::fixed_window::FixedWindowRoller;
use log4rs::append::rolling_file::policy::compound::trigger::size::SizeTrigger;
use log4rs::append::rolling_file::policy::compound::CompoundPolicy;
use log4rs::append::rolling_file::RollingFileAppender;
use log4rs::append::Append;
use log4rs::config::{Appender, Config, Logger, Root};
use log4rs::encode::pattern::PatternEncoder;

const LOG_PATTERN: &str = "{d(%Y-%m-%d %H:%M:%S%.3f)} {level} [{thread}] {target} - {m}{n}";

/// init log4rs
/// level value: ["OFF", "ERROR", "WARN", "INFO", "DEBUG", "TRACE"], ignore ascii case
/// log_file: rolling file appender when set, console otherwise
pub fn init_log(level: &str, log_file: Option<&Path>) -> anyhow::Result<()> {
    let default_level =
        LevelFilter::from_str(level).map_err(|_| anyhow!("can not parse log level `{}`", level))?;

    let encoder = PatternEncoder::new(LOG_PATTERN);

    let (name, appender) = match log_file {
        Some(path) => ("rolling_file", create_rolling_file_appender(encoder, path)?),
        None => ("console", create_console_appender(encoder)),
    };

    let config = Config::builder()
        .appender(Appender::builder().build(name, appender))
        .logger(Logger::builder().build("rdkafka", Warn))
        .build(Root::builder().appender(name).build(default_level))?;

    log4rs::init_config(config)?;
    Ok(())
}

fn create_console_appender(encoder: PatternEncoder) -> Box<dyn Append> {
    let stdout = ConsoleAppender::builder()
        .target(Target::Stdout)
        .encoder(Box::new(encoder))
        .build();
    Box::new(stdout)
}

fn create_rolling_file_appender(
    encoder: PatternEncoder,
    path: &Path,
) -> anyhow::Result<Box<dyn Append>> {
    let roll_path = format!("{}.{{}}", path.display());

    let trigger = SizeTrigger::new(50 * 1024 * 1024);
    let roll = FixedWindowRoller::builder()
        .base(1)
        .build(roll_path.as_str(), 20)?;
    let policy = CompoundPolicy::new(Box::new(trigger), Box::new(roll));

    let rolling_file = RollingFileAppender::builder()
        .encoder(Box::new(encoder))
        .append(true)
        .build(path, Box::new(policy))?;
    Ok(Box::new(rolling_file))
}
