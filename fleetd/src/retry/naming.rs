//! Resource name and tag sanitizers, one per provider naming rule set

/// Label/tag marking resources created by fleetd
pub const MANAGED_BY_KEY: &str = "managed-by";
pub const MANAGED_BY_VALUE: &str = "fleetd";
pub const WORKSPACE_LABEL: &str = "fleet-workspace";
pub const INSTANCE_LABEL: &str = "fleet-instance";

fn collapse_dashes(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut last_dash = false;
    for c in s.chars() {
        if c == '-' {
            if !last_dash {
                out.push(c);
            }
            last_dash = true;
        } else {
            out.push(c);
            last_dash = false;
        }
    }
    out
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

/// Docker: `[a-zA-Z0-9][a-zA-Z0-9_.-]*`
pub fn docker_container_name(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect();
    let trimmed = cleaned.trim_start_matches(|c: char| !c.is_ascii_alphanumeric());
    let name = truncate(trimmed, 128);
    if name.is_empty() {
        "fleet".to_string()
    } else {
        name
    }
}

/// ECS service/cluster and task family: letters, digits, `-`, `_`, at most 255
pub fn ecs_name(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_') {
                c
            } else {
                '-'
            }
        })
        .collect();
    let name = truncate(&collapse_dashes(&cleaned), 255);
    if name.is_empty() {
        "fleet".to_string()
    } else {
        name
    }
}

/// GCE instances: `[a-z]([-a-z0-9]{0,61}[a-z0-9])?`
pub fn gce_instance_name(raw: &str) -> String {
    let lowered: String = raw
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_lowercase() || c.is_ascii_digit() { c } else { '-' })
        .collect();
    let mut name = collapse_dashes(&lowered);
    if !name.starts_with(|c: char| c.is_ascii_lowercase()) {
        name = format!("f-{}", name.trim_start_matches('-'));
    }
    let mut name = truncate(&name, 63);
    while name.ends_with('-') {
        name.pop();
    }
    name
}

/// GCP label keys and values: lowercase letters, digits, `_`, `-`, at most 63
pub fn gcp_label(raw: &str) -> String {
    let lowered: String = raw
        .to_ascii_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    truncate(&lowered, 63)
}

/// Azure Linux VM names: alphanumerics and `-`, no leading/trailing `-`, at most 64
pub fn azure_vm_name(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    let collapsed = collapse_dashes(&cleaned);
    let name = truncate(collapsed.trim_matches('-'), 64);
    let name = name.trim_end_matches('-').to_string();
    if name.is_empty() {
        "fleet".to_string()
    } else {
        name
    }
}

/// Key Vault secret names: alphanumerics and `-`, at most 127
pub fn azure_secret_name(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    truncate(collapse_dashes(&cleaned).trim_matches('-'), 127)
}

/// AWS Secrets Manager names: alphanumerics and `/_+=.@-`, at most 512
pub fn aws_secret_name(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || "/_+=.@-".contains(c) {
                c
            } else {
                '-'
            }
        })
        .collect();
    truncate(&cleaned, 512)
}

/// GCP Secret Manager ids: letters, digits, `_`, `-`, at most 255
pub fn gcp_secret_id(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '_' | '-') { c } else { '_' })
        .collect();
    truncate(&cleaned, 255)
}

/// AWS tag values: at most 256 characters
pub fn aws_tag_value(raw: &str) -> String {
    truncate(raw, 256)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_docker_name() {
        assert_eq!(docker_container_name("ws/My Bot:1"), "ws-My-Bot-1");
        assert_eq!(docker_container_name("__x"), "x");
        assert_eq!(docker_container_name("!!!"), "fleet");
    }

    #[test]
    fn test_gce_name_rules() {
        assert_eq!(gce_instance_name("Prod_Bot--01"), "prod-bot-01");
        assert_eq!(gce_instance_name("1bot"), "f-1bot");
        let long = "a".repeat(80);
        assert_eq!(gce_instance_name(&long).len(), 63);
        assert!(!gce_instance_name("bot-").ends_with('-'));
    }

    #[test]
    fn test_azure_names() {
        assert_eq!(azure_vm_name("-my.bot_1-"), "my-bot-1");
        assert_eq!(azure_secret_name("fleet/i-1/OPENAI_API_KEY"), "fleet-i-1-OPENAI-API-KEY");
    }

    #[test]
    fn test_cloud_secret_names() {
        assert_eq!(aws_secret_name("fleet/i 1/key"), "fleet/i-1/key");
        assert_eq!(gcp_secret_id("fleet/i-1/key"), "fleet_i-1_key");
        assert_eq!(gcp_label("Team.Alpha"), "team_alpha");
        assert_eq!(ecs_name("ws.bot  one"), "ws-bot-one");
    }
}
