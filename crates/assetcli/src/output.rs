use anyhow::Result;
use assetcache_service::caching::{FetchOutput, FetchResponse};
use assetcache_service::types::Contents;
use serde_json::{Value, json};

use crate::settings::OutputFormat;

pub fn print_output(output: &FetchOutput, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Plain => print_plain(output),
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&output_json(output)?)?);
            Ok(())
        }
    }
}

fn print_plain(output: &FetchOutput) -> Result<()> {
    if let FetchOutput::Response(response) = output {
        let status = response
            .status
            .map_or_else(|| "-".to_owned(), |status| status.to_string());
        println!("{} {} ({:?})", status, response.url, response.cache);
        for (name, value) in &response.headers {
            println!("{name}: {value}");
        }
        println!();
    }

    match output.contents() {
        Contents::Buffer(bytes) => println!("<{} bytes>", bytes.len()),
        Contents::Text(text) => print!("{text}"),
        Contents::Json(value) => println!("{}", serde_json::to_string_pretty(value)?),
        Contents::Markup(node) => println!("{}", serde_json::to_string_pretty(node)?),
    }
    Ok(())
}

fn output_json(output: &FetchOutput) -> Result<Value> {
    Ok(match output {
        FetchOutput::Value(contents) => contents_json(contents)?,
        FetchOutput::Response(response) => response_json(response)?,
    })
}

fn response_json(response: &FetchResponse) -> Result<Value> {
    Ok(json!({
        "url": response.url,
        "status": response.status,
        "headers": response.headers,
        "cache": response.cache,
        "body": contents_json(&response.body)?,
    }))
}

fn contents_json(contents: &Contents) -> Result<Value> {
    Ok(match contents {
        Contents::Buffer(bytes) => json!({ "size": bytes.len() }),
        Contents::Text(text) => Value::String(text.clone()),
        Contents::Json(value) => value.clone(),
        Contents::Markup(node) => serde_json::to_value(node)?,
    })
}
