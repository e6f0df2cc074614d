pub mod api;
pub mod config;
pub mod docker_client;
pub mod error;
pub mod events;
pub mod executor;
pub mod lifecycle;
pub mod models;
pub mod ports;
pub mod process;
pub mod slack_client;
pub mod slash_cmd;
pub mod source;
pub mod store;
pub mod webhook;

#[cfg(test)]
pub(crate) mod testing;

pub use api::AppState;
pub use config::Config;
pub use error::PreviewError;
pub use lifecycle::{Actor, BuildTicket, PreviewService};
pub use models::*;

/// Lowercases and replaces everything outside `[a-z0-9-]` with `-`, so the
/// result is usable as a container or image name segment.
pub fn sanitize_name(raw: &str) -> String {
    raw.to_ascii_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

/// Container name for one build attempt of a pull request preview.
/// Returns "pv-{project prefix}-pr{pr_number}-b{build_number}".
pub fn derive_container_name(project: &Project, pr_number: u64, build_number: u32) -> String {
    let simple = project.id.simple().to_string();
    let prefix = &simple[..16];
    sanitize_name(&format!("pv-{}-pr{}-b{}", prefix, pr_number, build_number))
}
