//! Read-only reporting commands: instance listing and cost summary.

use anyhow::Result;

use crate::config::Config;
use crate::error::ConfigError;
use crate::output::{OutputContext, format_instance};
use crate::provider::{Filter, Provider};
use crate::store::Store;

/// Listing rows for the given scope: `None` lists everything not yet
/// terminated, `"all"` includes terminated instances, any other value is
/// a single state name.
///
/// # Errors
///
/// Propagates provider request failures.
pub async fn list_rows<P: Provider>(
    provider: &P,
    config: &Config,
    ctx: &OutputContext,
    scope: Option<&str>,
) -> Result<Vec<String>> {
    let filter = match scope {
        None => Filter::active(),
        Some("all") => Filter::all_states(),
        Some(state) => Filter::state(&[state]),
    };
    let instances = provider.get_instances(&[filter]).await?;
    Ok(instances
        .iter()
        .map(|instance| {
            let protected = config
                .profile_opt(&instance.name)
                .is_some_and(|p| p.protected);
            format_instance(ctx, instance, protected)
        })
        .collect())
}

/// Cost rows: accumulated runtime hours times the profile's hourly cost,
/// one row per tracked id. Ids whose instance no longer resolves (long
/// terminated) are skipped with a log line; a tracked instance whose
/// profile has no `hourly_cost` is a configuration error.
///
/// # Errors
///
/// Returns [`ConfigError::MissingField`] for a priceless profile, or
/// propagates store failures.
pub async fn cost_rows<P: Provider>(
    provider: &P,
    store: &Store,
    config: &Config,
) -> Result<Vec<String>> {
    let mut rows = Vec::new();
    for (id, seconds) in store.runtime_by_id()? {
        let instance = match provider.get_instance_by_id(&id).await {
            Ok(instance) => instance,
            Err(e) => {
                tracing::warn!(id, error = %e, "tracked id no longer resolves; skipping");
                continue;
            }
        };
        let hourly_cost = config
            .profile(&instance.name)?
            .hourly_cost
            .ok_or_else(|| ConfigError::missing(instance.name.as_str(), "hourly_cost"))?;
        let hours = seconds / 3600.0;
        rows.push(format!(
            "{hours:.2}h {} ${:.2}",
            instance.name,
            hours * hourly_cost
        ));
    }
    Ok(rows)
}
