//! Resource contract command.
//!
//! Shows, per attribute, whether a role may read, create or update it.

use anyhow::{Context, Result};
use clap::Args;
use keystone_core::policy::{ResourceType, RoleId};
use serde::Serialize;
use std::path::PathBuf;
use tabled::Tabled;

use super::config;
use crate::output::{self, OutputFormat};

#[derive(Args)]
pub struct DescribeArgs {
    /// Manifest file
    manifest: PathBuf,

    /// Resource type
    resource: String,

    /// Role to describe (defaults to the `default-role` config value)
    #[arg(short, long)]
    role: Option<String>,
}

#[derive(Debug, Serialize, Tabled)]
struct AttributeRow {
    #[tabled(rename = "Attribute")]
    name: String,
    #[tabled(rename = "Type")]
    kind: String,
    #[tabled(rename = "Read")]
    read: String,
    #[tabled(rename = "Create")]
    create: String,
    #[tabled(rename = "Update")]
    update: String,
}

pub fn execute(args: DescribeArgs, format: OutputFormat) -> Result<()> {
    let role = args
        .role
        .or_else(config::load_default_role)
        .context("No role given; pass --role or set default-role")?;

    let compiled = super::compile(&args.manifest)?;
    let description = keystone_core::surface::describe_resource(
        &compiled.registry,
        &ResourceType::new(args.resource.as_str()),
        &RoleId::new(role.as_str()),
    )?;

    match format {
        OutputFormat::Table => {
            output::print_header(&format!("{} as {}", description.resource_type, description.role));
            output::print_detail("Resolution", description.resolution.as_str());
            let actions: Vec<&str> = description.actions.iter().map(|v| v.as_str()).collect();
            let actions = if actions.is_empty() {
                "none".to_string()
            } else {
                actions.join(", ")
            };
            output::print_detail("Actions", &actions);
            println!();

            let rows: Vec<AttributeRow> = description
                .attributes
                .iter()
                .map(|attr| AttributeRow {
                    name: attr.name.clone(),
                    kind: format!("{:?}", attr.kind).to_lowercase(),
                    read: output::flag(attr.readable),
                    create: output::flag(attr.creatable),
                    update: output::flag(attr.updatable),
                })
                .collect();
            output::print_list(&rows, format)?;
        }
        _ => output::print_item(&description, format)?,
    }

    Ok(())
}
