use anyhow::Context;

use mcgate_gateway::config_loader::GatewayConfig;
use mcgate_gateway::proxy::run_proxy;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut config = GatewayConfig::load().context("load gateway config")?;
    apply_args(&mut config, std::env::args().skip(1))?;
    run_proxy(config).await
}

/// One optional positional argument: the upstream server hostname.
fn apply_args(
    config: &mut GatewayConfig,
    args: impl IntoIterator<Item = String>,
) -> anyhow::Result<()> {
    let mut args = args.into_iter();
    if let Some(host) = args.next() {
        if host == "-h" || host == "--help" || args.next().is_some() {
            anyhow::bail!("usage: mcgate [upstream-host]");
        }
        config.upstream.host = host;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positional_host_overrides_the_config() {
        let mut config = GatewayConfig::default();
        apply_args(&mut config, vec!["mc.example.net".to_string()]).unwrap();
        assert_eq!(config.upstream.host, "mc.example.net");
    }

    #[test]
    fn no_args_keeps_the_default() {
        let mut config = GatewayConfig::default();
        apply_args(&mut config, Vec::new()).unwrap();
        assert_eq!(config.upstream.host, "2b2t.org");
    }

    #[test]
    fn extra_args_are_rejected() {
        let mut config = GatewayConfig::default();
        assert!(apply_args(
            &mut config,
            vec!["a.example".to_string(), "b.example".to_string()]
        )
        .is_err());
    }
}
