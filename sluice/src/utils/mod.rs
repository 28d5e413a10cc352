pub mod date_time;
pub mod thread;

pub const VERSION: &'static str = env!("CARGO_PKG_VERSION");

/// Looks up a `key=value` style process argument.
pub fn parse_arg(arg_key: &str) -> anyhow::Result<String> {
    for arg in std::env::args() {
        if let Some((key, value)) = arg.split_once('=') {
            if key.eq(arg_key) {
                return Ok(value.to_string());
            }
        }
    }

    Err(anyhow!("`{}` argument is not found", arg_key))
}
