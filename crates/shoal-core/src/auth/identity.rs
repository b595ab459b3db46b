use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kinds of callers that can authenticate.
///
/// The same enum doubles as the `sender_type` recorded on every message,
/// which is what `agent_only` visibility keys on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    Generic,
    Claude,
    Gemini,
    Custom,
    Admin,
    System,
    Test,
}

impl AgentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Generic => "generic",
            Self::Claude => "claude",
            Self::Gemini => "gemini",
            Self::Custom => "custom",
            Self::Admin => "admin",
            Self::System => "system",
            Self::Test => "test",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "generic" => Some(Self::Generic),
            "claude" => Some(Self::Claude),
            "gemini" => Some(Self::Gemini),
            "custom" => Some(Self::Custom),
            "admin" => Some(Self::Admin),
            "system" => Some(Self::System),
            "test" => Some(Self::Test),
            _ => None,
        }
    }

    pub fn all() -> &'static [AgentType] {
        &[
            Self::Generic,
            Self::Claude,
            Self::Gemini,
            Self::Custom,
            Self::Admin,
            Self::System,
            Self::Test,
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    Read,
    Write,
    Debug,
    Admin,
}

impl Permission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Debug => "debug",
            Self::Admin => "admin",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "read" => Some(Self::Read),
            "write" => Some(Self::Write),
            "debug" => Some(Self::Debug),
            "admin" => Some(Self::Admin),
            _ => None,
        }
    }
}

/// The resolved caller identity attached to every authenticated call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentIdentity {
    pub agent_id: String,
    pub agent_type: AgentType,
    pub permissions: Vec<Permission>,
    pub token_id: String,
    pub authenticated_at: DateTime<Utc>,
}

impl AgentIdentity {
    pub fn has(&self, permission: Permission) -> bool {
        self.permissions.contains(&permission)
    }

    pub fn is_admin(&self) -> bool {
        self.has(Permission::Admin)
    }
}

/// Intersect the requested permission names with what the policy allows
/// for this agent type. Unknown names are dropped silently; `admin` is
/// only ever granted to admin-class identities.
pub fn grant(agent_type: AgentType, requested: &[String]) -> Vec<Permission> {
    let mut granted = Vec::new();
    for name in requested {
        let Some(permission) = Permission::parse(name) else {
            continue;
        };
        if allowed(agent_type, permission) && !granted.contains(&permission) {
            granted.push(permission);
        }
    }
    granted
}

fn allowed(agent_type: AgentType, permission: Permission) -> bool {
    match permission {
        Permission::Read | Permission::Write => true,
        Permission::Debug => matches!(
            agent_type,
            AgentType::Admin | AgentType::System | AgentType::Test
        ),
        Permission::Admin => matches!(agent_type, AgentType::Admin),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn read_write_granted_to_everyone() {
        for agent_type in AgentType::all() {
            let granted = grant(*agent_type, &req(&["read", "write"]));
            assert_eq!(granted, vec![Permission::Read, Permission::Write]);
        }
    }

    #[test]
    fn admin_requires_admin_type() {
        assert!(grant(AgentType::Claude, &req(&["admin"])).is_empty());
        assert!(grant(AgentType::Generic, &req(&["admin"])).is_empty());
        assert_eq!(
            grant(AgentType::Admin, &req(&["admin"])),
            vec![Permission::Admin]
        );
    }

    #[test]
    fn debug_is_restricted() {
        assert!(grant(AgentType::Gemini, &req(&["debug"])).is_empty());
        assert_eq!(
            grant(AgentType::Test, &req(&["debug"])),
            vec![Permission::Debug]
        );
        assert_eq!(
            grant(AgentType::System, &req(&["debug"])),
            vec![Permission::Debug]
        );
    }

    #[test]
    fn unknown_permissions_are_dropped_silently() {
        let granted = grant(AgentType::Claude, &req(&["read", "fly", "write", ""]));
        assert_eq!(granted, vec![Permission::Read, Permission::Write]);
    }

    #[test]
    fn duplicates_collapse() {
        let granted = grant(AgentType::Claude, &req(&["read", "read", "read"]));
        assert_eq!(granted, vec![Permission::Read]);
    }

    #[test]
    fn agent_type_round_trips() {
        for agent_type in AgentType::all() {
            assert_eq!(AgentType::parse(agent_type.as_str()), Some(*agent_type));
        }
        assert_eq!(AgentType::parse("robot"), None);
    }
}
