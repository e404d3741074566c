//! End-to-end example (including Cargo.toml) of a small service run over
//! FastCGI: either spawned on demand with stdin as the listen socket (the
//! `mod_fcgid` style of shared hosting this runtime is built for), or bound
//! to a TCP/Unix socket directly for local testing.
use clap::Parser;
use fcgi_runtime::app::Application;
use fcgi_runtime::config::Config;
use fcgi_runtime::session::file_store::FileSessionStore;
use fcgi_runtime::wire::parse_listen_address;
use std::sync::Arc;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt};

mod app;

#[derive(Parser)]
struct Cli {
    /// Where to listen: `stdin` (the default, for mod_fcgid-style spawning),
    /// `:PORT`/`*:PORT` for all interfaces, `HOST:PORT`, or an absolute Unix
    /// socket path.
    #[arg(long, default_value = "stdin")]
    listen: String,

    /// An alternate URI path to mount the app at, for shared domains. Use a
    /// leading and trailing slash, like `/nested/`.
    #[arg(long, value_name = "PATH", default_value = "/")]
    mount: String,

    /// Extra worker processes to pre-fork. 0 (the default) runs a single
    /// process.
    #[arg(long, default_value_t = 0)]
    forks: u32,
}

fn main() {
    let args = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(fmt::layer().with_timer(fmt::time::uptime()))
        .init();

    let mut config = Config::default();
    config.forks = args.forks;

    let sessions = Arc::new(
        FileSessionStore::new(
            std::env::temp_dir().join("dadjoke-sessions"),
            "dadjoke_".to_string(),
            config.session_cookie_name.clone(),
            std::time::Duration::from_secs(config.session_ttl_secs),
        )
        .expect("failed to open session directory"),
    );

    let service = Arc::new(app::DadApp::new(&args.mount, config.session_id_width));
    let listen = parse_listen_address(&args.listen).expect("invalid --listen address");

    tracing::info!(listen = %args.listen, mount = %args.mount, "starting dadjoke");
    Application::new(config, sessions, service)
        .run(listen)
        .expect("application runtime exited with an error");
}
