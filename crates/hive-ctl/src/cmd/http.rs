//! Shared HTTP request helpers for CLI commands.

use anyhow::{Context, Result, bail};
use serde::Deserialize;

pub fn base_url(port: u16) -> String {
    format!("http://127.0.0.1:{}/api", port)
}

fn connect_error(url: &str) -> String {
    format!("failed to connect to hived at {}, is it running?", url)
}

/// Turn a non-2xx response into an error carrying the server's message.
async fn check(resp: reqwest::Response) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    bail!("daemon returned {}: {}", status, body.trim())
}

pub async fn get_json<T: for<'de> Deserialize<'de>>(url: &str) -> Result<T> {
    let resp = reqwest::get(url)
        .await
        .with_context(|| connect_error(url))?;
    check(resp)
        .await?
        .json::<T>()
        .await
        .context("failed to parse response")
}

pub async fn get_bytes(url: &str) -> Result<Vec<u8>> {
    let resp = reqwest::get(url)
        .await
        .with_context(|| connect_error(url))?;
    let bytes = check(resp)
        .await?
        .bytes()
        .await
        .context("failed to read response body")?;
    Ok(bytes.to_vec())
}

pub async fn post_json<T: for<'de> Deserialize<'de>>(url: &str) -> Result<T> {
    let resp = reqwest::Client::new()
        .post(url)
        .send()
        .await
        .with_context(|| connect_error(url))?;
    check(resp)
        .await?
        .json::<T>()
        .await
        .context("failed to parse response")
}

pub async fn post_multipart<T: for<'de> Deserialize<'de>>(
    url: &str,
    form: reqwest::multipart::Form,
) -> Result<T> {
    let resp = reqwest::Client::new()
        .post(url)
        .multipart(form)
        .send()
        .await
        .with_context(|| connect_error(url))?;
    check(resp)
        .await?
        .json::<T>()
        .await
        .context("failed to parse response")
}
