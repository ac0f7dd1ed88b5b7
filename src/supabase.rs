use postgrest::{Builder, Postgrest};
use serde::de::DeserializeOwned;

use crate::config::SupabaseConfig;

pub fn build_client(config: &SupabaseConfig) -> Postgrest {
    let client = Postgrest::new(format!("{}/rest/v1", config.url))
        .insert_header("apikey", &config.key)
        .insert_header("Authorization", format!("Bearer {}", config.key));

    log::debug!("Supabase client created for {}", config.url);
    client
}

/// Runs a PostgREST query and parses the body. Non-2xx statuses become an
/// error carrying the response text.
pub async fn execute_json<T: DeserializeOwned>(query: Builder) -> Result<T, String> {
    let text = execute(query).await?;
    serde_json::from_str(&text).map_err(|e| format!("failed to parse response: {e}"))
}

pub async fn execute(query: Builder) -> Result<String, String> {
    let response = query
        .execute()
        .await
        .map_err(|e| format!("supabase request failed: {e}"))?;

    let status = response.status();
    let text = response
        .text()
        .await
        .map_err(|e| format!("failed to read response: {e}"))?;

    if !status.is_success() {
        return Err(format!("supabase returned {status}: {text}"));
    }
    Ok(text)
}
