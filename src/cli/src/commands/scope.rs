//! Scope inspection command.
//!
//! Resolves a principal's policies for one resource type and prints the
//! resulting filter, plus the fallback chain each role went through.

use anyhow::Result;
use clap::Args;
use keystone_core::policy::{Principal, ResourceType, RoleId, Verb};
use keystone_core::scope::{Filter, ScopeResolver};
use serde::Serialize;
use std::path::PathBuf;
use tabled::Tabled;

use crate::output::{self, OutputFormat};

#[derive(Args)]
pub struct ScopeArgs {
    /// Manifest file
    manifest: PathBuf,

    /// Resource type
    resource: String,

    /// Role held by the principal (repeatable). Without roles and without
    /// --principal the request is anonymous.
    #[arg(short, long)]
    role: Vec<String>,

    /// Principal id
    #[arg(short, long)]
    principal: Option<String>,

    /// Tenant the principal belongs to (repeatable)
    #[arg(short, long)]
    tenant: Vec<String>,

    /// Only count roles that grant this verb
    #[arg(long)]
    verb: Option<String>,
}

#[derive(Debug, Serialize, Tabled)]
struct StepRow {
    #[tabled(rename = "Role")]
    role: String,
    #[tabled(rename = "Step")]
    step: String,
    #[tabled(rename = "Lookup")]
    key: String,
    #[tabled(rename = "Registered")]
    registered: String,
}

#[derive(Debug, Serialize)]
struct ScopeReport {
    resource_type: String,
    principal: Option<String>,
    roles: Vec<String>,
    verb: Option<String>,
    filter: Filter,
}

pub fn execute(args: ScopeArgs, format: OutputFormat) -> Result<()> {
    let compiled = super::compile(&args.manifest)?;
    let resource_type = ResourceType::new(args.resource.as_str());

    let principal = if args.principal.is_none() && args.role.is_empty() {
        None
    } else {
        let id = args.principal.clone().unwrap_or_else(|| "principal".to_string());
        let principal = args.role.iter().fold(Principal::new(id), |p, r| p.with_role(r.as_str()));
        Some(args.tenant.iter().fold(principal, |p, t| p.with_tenant(t.as_str())))
    };

    let resolver = ScopeResolver::new(compiled.registry.clone());
    let verb = args.verb.as_deref().map(Verb::parse);
    let filter = match &verb {
        Some(verb) => resolver.scope_for(principal.as_ref(), &resource_type, verb),
        None => resolver.scope(principal.as_ref(), &resource_type),
    };

    let roles: Vec<RoleId> = match &principal {
        Some(p) => p.roles().iter().cloned().collect(),
        None => vec![compiled.registry.anonymous_role().clone()],
    };

    match format {
        OutputFormat::Table => {
            output::print_header(&format!("Scope of {}", resource_type));
            output::print_detail(
                "Principal",
                principal.as_ref().map_or("anonymous", |p| p.id().as_str()),
            );
            if let Some(verb) = &verb {
                output::print_detail("Verb", verb.as_str());
            }
            output::print_detail("Filter", &render(&filter));
            println!();

            let rows: Vec<StepRow> = roles
                .iter()
                .flat_map(|role| {
                    compiled
                        .registry
                        .fallback_chain(role, &resource_type)
                        .into_iter()
                        .map(move |step| StepRow {
                            role: role.to_string(),
                            step: step.resolution.to_string(),
                            key: step.key,
                            registered: output::flag(step.registered),
                        })
                })
                .collect();
            output::print_list(&rows, format)?;

            if principal.as_ref().is_some_and(|p| p.roles().is_empty()) {
                output::print_info("Principal has no roles; every scope is empty.");
            }
        }
        _ => {
            let report = ScopeReport {
                resource_type: resource_type.to_string(),
                principal: principal.as_ref().map(|p| p.id().to_string()),
                roles: roles.iter().map(|r| r.to_string()).collect(),
                verb: verb.map(|v| v.to_string()),
                filter,
            };
            output::print_item(&report, format)?;
        }
    }

    Ok(())
}

/// Human-readable rendering of a filter.
fn render(filter: &Filter) -> String {
    let join = |filters: &[Filter], op: &str| {
        filters
            .iter()
            .map(|f| match f {
                Filter::And { .. } | Filter::Or { .. } => format!("({})", render(f)),
                other => render(other),
            })
            .collect::<Vec<_>>()
            .join(op)
    };

    match filter {
        Filter::All => "all records".to_string(),
        Filter::Nothing => "no records".to_string(),
        Filter::Eq { field, value } => format!("{} = {}", field, value),
        Filter::In { field, values } => {
            let values: Vec<String> = values.iter().map(|v| v.to_string()).collect();
            format!("{} in [{}]", field, values.join(", "))
        }
        Filter::InRelation { field, join } => format!(
            "{} in (select {} from {} where {} = {})",
            field, join.select, join.relation, join.column, join.value
        ),
        Filter::And { filters } => join(filters.as_slice(), " and "),
        Filter::Or { filters } => join(filters.as_slice(), " or "),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_render_nested() {
        let filter = Filter::Or {
            filters: vec![
                Filter::eq("owner_id", "alice"),
                Filter::And {
                    filters: vec![Filter::eq("public", true), Filter::one_of("team", vec![json!("a")])],
                },
            ],
        };
        assert_eq!(
            render(&filter),
            r#"owner_id = "alice" or (public = true and team in ["a"])"#
        );
    }

    #[test]
    fn test_render_constants() {
        assert_eq!(render(&Filter::All), "all records");
        assert_eq!(render(&Filter::Nothing), "no records");
    }
}
