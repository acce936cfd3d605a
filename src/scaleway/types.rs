//! Newtypes for Scaleway lifecycle values to avoid stringly-typed code.

use std::fmt;

use crate::backend::InstanceStatus;

macro_rules! newtype {
    ($name:ident) => {
        #[derive(Clone, Debug, Eq, PartialEq)]
        pub(crate) struct $name(String);

        impl $name {
            pub(crate) const fn as_str(&self) -> &str {
                self.0.as_str()
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_owned())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

newtype!(Zone);
newtype!(ServerState);

impl ServerState {
    /// Maps the provider state onto the backend-neutral status.
    ///
    /// Anything short of `running` is still on its way up; servers the API no
    /// longer returns are reported separately as non-existent.
    pub(crate) fn status(&self) -> InstanceStatus {
        match self.as_str() {
            "running" => InstanceStatus::Running,
            _ => InstanceStatus::Pending,
        }
    }
}
