//! Manifest validation command.
//!
//! Compiles the manifest exactly as the engine would at startup. Any
//! configuration error fails the command.

use anyhow::Result;
use clap::Args;
use serde::Serialize;
use std::path::PathBuf;
use tabled::Tabled;

use crate::output::{self, OutputFormat};

#[derive(Args)]
pub struct ValidateArgs {
    /// Manifest file (.toml, .yaml, .yml or .json)
    manifest: PathBuf,
}

#[derive(Debug, Serialize, Tabled)]
struct ResourceRow {
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Attributes")]
    attributes: usize,
    #[tabled(rename = "Parents")]
    parents: String,
    #[tabled(rename = "Scoped By")]
    scoped_by: String,
}

#[derive(Debug, Serialize)]
struct Summary {
    manifest: String,
    valid: bool,
    roles: Vec<String>,
    policies: usize,
    bindings: usize,
    resources: Vec<ResourceRow>,
}

pub fn execute(args: ValidateArgs, format: OutputFormat) -> Result<()> {
    let compiled = super::compile(&args.manifest)?;

    let resources: Vec<ResourceRow> = compiled
        .catalog
        .resource_types()
        .filter_map(|rt| compiled.catalog.get(rt))
        .map(|schema| ResourceRow {
            resource: schema.name.to_string(),
            attributes: schema.attributes.len(),
            parents: schema
                .parents
                .iter()
                .map(|p| format!("{} -> {}", p.name, p.resource))
                .collect::<Vec<_>>()
                .join(", "),
            scoped_by: schema.scoping_parent.clone().unwrap_or_else(|| "-".to_string()),
        })
        .collect();

    let summary = Summary {
        manifest: args.manifest.display().to_string(),
        valid: true,
        roles: compiled.registry.roles().iter().map(|r| r.to_string()).collect(),
        policies: compiled.registry.len(),
        bindings: compiled.bindings.len(),
        resources,
    };

    match format {
        OutputFormat::Table => {
            output::print_header("Resources");
            output::print_list(&summary.resources, format)?;
            output::print_header("Policies");
            output::print_detail("Roles", &summary.roles.join(", "));
            output::print_detail("Policies", &summary.policies.to_string());
            output::print_detail("Bindings", &summary.bindings.to_string());
            println!();
            output::print_success(&format!("{} is valid", summary.manifest));
        }
        _ => output::print_item(&summary, format)?,
    }

    Ok(())
}
