//! Notification routes command.

use anyhow::Result;
use clap::Args;
use serde::Serialize;
use std::path::PathBuf;
use tabled::Tabled;

use crate::output::{self, OutputFormat};

#[derive(Args)]
pub struct RoutesArgs {
    /// Manifest file
    manifest: PathBuf,

    /// Only show bindings for this key (e.g. widget.created)
    #[arg(short, long)]
    key: Option<String>,
}

#[derive(Debug, Serialize, Tabled)]
struct RouteRow {
    #[tabled(rename = "Key")]
    key: String,
    #[tabled(rename = "Target Group")]
    group: String,
    #[tabled(rename = "Template")]
    template: String,
    #[tabled(rename = "Declared Route")]
    routed: String,
}

pub fn execute(args: RoutesArgs, format: OutputFormat) -> Result<()> {
    let compiled = super::compile(&args.manifest)?;
    let table = &compiled.bindings;

    let rows: Vec<RouteRow> = table
        .bindings()
        .filter(|b| args.key.as_deref().map_or(true, |k| b.key.to_string() == k))
        .map(|b| {
            let routed = table
                .routes_for(&b.key)
                .map_or(false, |groups| groups.contains(&b.group));
            RouteRow {
                key: b.key.to_string(),
                group: b.group.to_string(),
                template: b.template_path(),
                routed: match format {
                    OutputFormat::Table => output::flag(routed),
                    _ => routed.to_string(),
                },
            }
        })
        .collect();

    output::print_list(&rows, format)
}
