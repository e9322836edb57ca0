use clap::Parser;
use nginx_smoke_test::{run_suite, Args};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let mut stdout = std::io::stdout().lock();

    let report = match run_suite(&args, &mut stdout).await {
        Ok(report) => report,
        Err(err) => {
            eprintln!("could not write progress: {err}");
            std::process::exit(1);
        }
    };

    if let Err(err) = report.print(&mut stdout, args.format) {
        eprintln!("{err}");
        std::process::exit(1);
    }

    std::process::exit(report.exit_code());
}
