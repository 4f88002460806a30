use std::time::Duration;

use anyhow::Context;
use mc_domain::config::Config;

use crate::auth::HmacTokenVerifier;

/// Mint a client bearer token signed with the configured secret and print
/// it to stdout.
pub fn mint(config: &Config, subject: &str, ttl_secs: u64) -> anyhow::Result<()> {
    let verifier = HmacTokenVerifier::from_env(&config.auth.secret_env)
        .with_context(|| format!("${} is not set", config.auth.secret_env))?;
    let token = verifier
        .mint(subject, Duration::from_secs(ttl_secs))
        .context("minting token")?;
    println!("{token}");
    Ok(())
}
