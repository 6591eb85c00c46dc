use anyhow::Context;
use assetcache_service::logging;
use assetcache_service::metrics;
use assetcache_service::service::AssetFetchService;
use assetcache_service::sources::is_full_url;

use settings::Settings;

mod output;
mod settings;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let Settings {
        source,
        service_config,
        fetch_options,
        output_format,
    } = Settings::get()?;

    logging::init_logging(&service_config.logging);

    if let Some(ref statsd) = service_config.metrics.statsd {
        metrics::configure_statsd(
            &service_config.metrics.prefix,
            statsd,
            service_config.metrics.custom_tags.clone(),
        )
        .context("failed to configure statsd")?;
    }

    if !is_full_url(&source) {
        anyhow::bail!("`{source}` is not a full URL");
    }

    let service = AssetFetchService::new(service_config);
    let output = service
        .fetch(source.as_str(), &fetch_options)
        .await
        .with_context(|| format!("failed to fetch `{source}`"))?;

    output::print_output(&output, output_format)
}
