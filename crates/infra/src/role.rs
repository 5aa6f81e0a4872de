use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use hrms_core::DomainError;
use hrms_events::Method;

/// Which of the three services this process runs as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceRole {
    Auth,
    Profile,
    User,
}

impl ServiceRole {
    pub const ALL: [ServiceRole; 3] = [ServiceRole::Auth, ServiceRole::Profile, ServiceRole::User];

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceRole::Auth => "auth",
            ServiceRole::Profile => "profile",
            ServiceRole::User => "user",
        }
    }

    /// Methods this role applies to its replica.
    ///
    /// A role never consumes the method it is authoritative for.
    pub fn consumed_methods(&self) -> &'static [Method] {
        match self {
            ServiceRole::Auth => &[Method::UpdateUser, Method::UpdatePassword, Method::DeleteUser],
            ServiceRole::Profile => &[Method::CreateUser, Method::UpdatePassword, Method::DeleteUser],
            ServiceRole::User => &[Method::CreateUser, Method::UpdateUser, Method::UpdatePassword],
        }
    }

    /// Dispatch table with `DELETE.USER` optionally switched off.
    pub fn dispatch_table(&self, apply_deletes: bool) -> Vec<Method> {
        self.consumed_methods()
            .iter()
            .copied()
            .filter(|m| apply_deletes || *m != Method::DeleteUser)
            .collect()
    }
}

impl fmt::Display for ServiceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceRole {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auth" => Ok(ServiceRole::Auth),
            "profile" => Ok(ServiceRole::Profile),
            "user" => Ok(ServiceRole::User),
            other => Err(DomainError::invalid_argument(format!(
                "unknown service role: {other} (expected auth, profile or user)"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_tables_per_role() {
        assert_eq!(
            ServiceRole::Auth.dispatch_table(true),
            vec![Method::UpdateUser, Method::UpdatePassword, Method::DeleteUser]
        );
        assert_eq!(
            ServiceRole::Profile.dispatch_table(false),
            vec![Method::CreateUser, Method::UpdatePassword]
        );
        assert!(!ServiceRole::User.consumed_methods().contains(&Method::DeleteUser));
    }

    #[test]
    fn parses_case_insensitively() {
        assert_eq!(" Profile ".parse::<ServiceRole>().unwrap(), ServiceRole::Profile);
        assert!("billing".parse::<ServiceRole>().is_err());
        for role in ServiceRole::ALL {
            assert_eq!(role.as_str().parse::<ServiceRole>().unwrap(), role);
        }
    }
}
