use dh_core::config::Config;

/// Print the effective configuration, defaults included.
pub fn show(cfg: &Config) -> anyhow::Result<()> {
    print!("{}", cfg.to_toml()?);
    Ok(())
}
