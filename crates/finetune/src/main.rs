use sumtune::driver;
use sumtune::DriverConfig;
use tracing_subscriber::EnvFilter;

fn main() -> sumtune_core::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = DriverConfig::from_env()?;
    let times = driver::run(&config)?;
    println!("{}", driver::format_times(&times));
    Ok(())
}
