use clap::Parser;

/// Command-line arguments for the echo server
#[derive(Parser, Debug)]
#[command(name = "line-echo")]
#[command(about = "A concurrent TCP line echo server", long_about = None)]
pub struct Config {
    /// Port to listen on
    #[arg(default_value_t = 9090)]
    pub port: u16,

    /// Address to bind to
    #[arg(long, default_value = "0.0.0.0")]
    pub host: String,

    /// Seconds to wait for open connections to close on shutdown, before
    /// force-closing them
    #[arg(long, default_value_t = 5)]
    pub drain_timeout: u64,

    /// Maximum bytes buffered for a single line; a connection sending more
    /// without a terminator is closed
    #[arg(long, default_value_t = 1024 * 1024)]
    pub max_line_length: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}
