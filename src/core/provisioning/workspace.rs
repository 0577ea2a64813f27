//! Declarative infrastructure rendering for a client workspace.
//!
//! Rendering is a pure function of the client and the render settings. The
//! only time-dependent byte is the `# Generated on:` comment, which the
//! digest skips.

use chrono::{DateTime, SecondsFormat, Utc};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use crate::core::client::Client;
use crate::core::models::Provider;

pub const MAIN_FILE: &str = "main.tf";
pub const VARIABLES_FILE: &str = "variables.tf";
pub const RESTORE_VARS_FILE: &str = "restore.auto.tfvars";

const GENERATED_ON_PREFIX: &str = "# Generated on:";

/// Where a workspace's modules and state live.
#[derive(Debug, Clone)]
pub struct RenderSettings {
    pub modules_dir: PathBuf,
    pub state_file: String,
    /// Emit placeholder credentials so plans run without real accounts.
    pub dev_credentials: bool,
}

/// Restore parameters baked into an ephemeral workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreVars {
    pub backup_id: String,
    pub recovery_point_arn: String,
}

/// Files of a rendered workspace, keyed by file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedWorkspace {
    pub files: Vec<(&'static str, String)>,
}

impl RenderedWorkspace {
    /// BLAKE3 digest over every file, ignoring the generation timestamp.
    pub fn digest(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        for (name, content) in &self.files {
            hasher.update(name.as_bytes());
            for line in content.lines() {
                if line.starts_with(GENERATED_ON_PREFIX) {
                    continue;
                }
                hasher.update(line.as_bytes());
                hasher.update(b"\n");
            }
        }
        hasher.finalize().to_hex().to_string()
    }

    pub async fn write_to(&self, dir: &Path) -> std::io::Result<()> {
        tokio::fs::create_dir_all(dir).await?;
        for (name, content) in &self.files {
            tokio::fs::write(dir.join(name), content).await?;
        }
        Ok(())
    }
}

pub fn render(
    client: &Client,
    settings: &RenderSettings,
    restore: Option<&RestoreVars>,
    generated_at: DateTime<Utc>,
) -> RenderedWorkspace {
    let mut files = vec![
        (MAIN_FILE, render_main(client, settings, generated_at)),
        (VARIABLES_FILE, render_variables(client)),
    ];
    if let Some(vars) = restore {
        files.push((RESTORE_VARS_FILE, render_restore_vars(vars)));
    }
    RenderedWorkspace { files }
}

fn render_main(client: &Client, settings: &RenderSettings, generated_at: DateTime<Utc>) -> String {
    let providers = client.enabled_providers();
    let cfg = &client.backup_config;
    let slug = client.slug();
    let mut out = String::new();

    let _ = writeln!(out, "# Infrastructure for client: {}", client.name);
    let _ = writeln!(
        out,
        "{} {}",
        GENERATED_ON_PREFIX,
        generated_at.to_rfc3339_opts(SecondsFormat::Secs, true)
    );
    out.push_str("\nterraform {\n  required_providers {\n");
    for provider in &providers {
        let (name, source, version) = match provider {
            Provider::Aws => ("aws", "hashicorp/aws", "~> 4.0"),
            Provider::Azure => ("azurerm", "hashicorp/azurerm", "~> 3.0"),
            Provider::Gcp => ("google", "hashicorp/google", "~> 4.0"),
        };
        let _ = writeln!(
            out,
            "    {name} = {{\n      source  = {}\n      version = {}\n    }}",
            hcl_str(source),
            hcl_str(version)
        );
    }
    out.push_str("  }\n\n");
    let _ = writeln!(
        out,
        "  backend \"local\" {{\n    path = {}\n  }}\n}}\n",
        hcl_str(&settings.state_file)
    );

    for provider in &providers {
        match provider {
            Provider::Aws => {
                let region = hcl_str(&cfg.aws.region);
                let _ = writeln!(out, "provider \"aws\" {{\n  region = {region}");
                if settings.dev_credentials {
                    out.push_str(concat!(
                        "  access_key                  = \"fake-access-key\"\n",
                        "  secret_key                  = \"fake-secret-key\"\n",
                        "  skip_credentials_validation = true\n",
                        "  skip_requesting_account_id  = true\n",
                        "  skip_metadata_api_check     = true\n",
                    ));
                }
                out.push_str("}\n\n");
            }
            Provider::Azure => {
                out.push_str("provider \"azurerm\" {\n  features {}\n");
                if settings.dev_credentials {
                    out.push_str("  skip_provider_registration = true\n");
                }
                out.push_str("}\n\n");
            }
            Provider::Gcp => {
                let project = cfg.gcp.project_id.as_deref().unwrap_or("my-project");
                let _ = writeln!(
                    out,
                    "provider \"google\" {{\n  project = {}\n  region  = {}",
                    hcl_str(project),
                    hcl_str(&cfg.gcp.region)
                );
                out.push_str("}\n\n");
            }
        }
    }

    for provider in &providers {
        let module_source = settings.modules_dir.join(provider.as_str());
        let _ = writeln!(out, "module \"{}_backup\" {{", provider.as_str());
        let _ = writeln!(out, "  source = {}\n", hcl_str(&module_source.display().to_string()));
        out.push_str("  client_id   = var.client_id\n  client_name = var.client_name\n\n");
        out.push_str("  restore_mode       = var.restore_mode\n");
        out.push_str("  backup_id          = var.backup_id\n");
        out.push_str("  recovery_point_arn = var.recovery_point_arn\n\n");
        let _ = writeln!(out, "  retention_days = {}", cfg.retention_days);

        match provider {
            Provider::Aws => {
                let vault = cfg
                    .aws
                    .backup_vault_name
                    .clone()
                    .unwrap_or_else(|| format!("{slug}-vault"));
                let resources = if cfg.aws.resources.is_empty() {
                    vec!["*".to_string()]
                } else {
                    cfg.aws.resources.clone()
                };
                let _ = writeln!(out, "  backup_vault_name   = {}", hcl_str(&vault));
                let _ = writeln!(out, "  resources_to_backup = {}", hcl_list(&resources));
            }
            Provider::Azure => {
                let group = cfg
                    .azure
                    .resource_group_name
                    .clone()
                    .unwrap_or_else(|| format!("{slug}-rg"));
                let _ = writeln!(out, "  resource_group_name = {}", hcl_str(&group));
                let _ = writeln!(out, "  location            = {}", hcl_str(&cfg.azure.location));
                let vault = hcl_str(&format!("{slug}-vault"));
                let _ = writeln!(out, "  recovery_vault_name = {vault}");
                let frequency = hcl_str(cfg.frequency.as_str());
                let _ = writeln!(out, "  backup_frequency    = {frequency}");
                let _ = writeln!(out, "  backup_time         = {}", hcl_str(&cfg.start_time));
            }
            Provider::Gcp => {
                let project = cfg.gcp.project_id.as_deref().unwrap_or("my-project");
                let _ = writeln!(out, "  project_id         = {}", hcl_str(project));
                let _ = writeln!(out, "  location           = {}", hcl_str(&cfg.gcp.region));
                let bucket = hcl_str(&format!("{slug}-backup"));
                let _ = writeln!(out, "  backup_bucket_name = {bucket}");
            }
        }

        let (tags_key, env_key, client_key, managed_key, client_value) = match provider {
            Provider::Gcp => ("labels", "environment", "client", "managed_by", slug.clone()),
            _ => ("tags", "Environment", "Client", "ManagedBy", client.name.clone()),
        };
        let _ = writeln!(out, "\n  {tags_key} = {{");
        let _ = writeln!(out, "    {env_key} = {}", hcl_str(&client.environment));
        let _ = writeln!(out, "    {client_key} = {}", hcl_str(&client_value));
        let _ = writeln!(out, "    {managed_key} = \"drover\"");
        out.push_str("  }\n}\n\n");
    }

    out
}

fn render_variables(client: &Client) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# Variables for client: {}\n", client.name);
    let vars: [(&str, &str, &str, String); 5] = [
        ("client_id", "The unique ID of the client", "string", hcl_str(&client.id)),
        ("client_name", "The name of the client", "string", hcl_str(&client.name)),
        ("restore_mode", "Provision from a recovery point", "bool", "false".to_string()),
        ("backup_id", "Backup job being restored", "string", hcl_str("")),
        ("recovery_point_arn", "Recovery point to restore from", "string", hcl_str("")),
    ];
    for (name, description, ty, default) in vars {
        let description = hcl_str(description);
        let _ = writeln!(out, "variable \"{name}\" {{");
        let _ = writeln!(out, "  description = {description}");
        let _ = writeln!(out, "  type        = {ty}");
        let _ = writeln!(out, "  default     = {default}");
        let _ = writeln!(out, "}}\n");
    }
    out
}

fn render_restore_vars(vars: &RestoreVars) -> String {
    format!(
        "restore_mode       = true\nbackup_id          = {}\nrecovery_point_arn = {}\n",
        hcl_str(&vars.backup_id),
        hcl_str(&vars.recovery_point_arn)
    )
}

/// Quote a string for HCL, escaping interpolation sequences.
fn hcl_str(value: &str) -> String {
    let escaped = value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace("${", "$${")
        .replace("%{", "%%{");
    format!("\"{escaped}\"")
}

fn hcl_list(values: &[String]) -> String {
    let items: Vec<String> = values.iter().map(|v| hcl_str(v)).collect();
    format!("[{}]", items.join(", "))
}
