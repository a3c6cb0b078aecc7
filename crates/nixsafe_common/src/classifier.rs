//! Operation classifier adapter
//!
//! Buckets every OperationKind into exactly one AccessClass. The match is
//! exhaustive, so a new kind cannot compile without a mapping; kinds that do
//! not change the system land in `read-only`.

use crate::types::{AccessClass, Intent, OperationKind};

/// Total, side-effect free mapping from kind to risk tier
pub fn classify(kind: OperationKind) -> AccessClass {
    match kind {
        OperationKind::InstallPackage => AccessClass::InstallPackage,
        OperationKind::RemovePackage => AccessClass::RemovePackage,
        OperationKind::UpdateSystem
        | OperationKind::Rollback
        | OperationKind::Configure
        | OperationKind::StartService
        | OperationKind::StopService => AccessClass::ModifyConfiguration,
        OperationKind::SearchPackage
        | OperationKind::ServiceStatus
        | OperationKind::ListInstalled
        | OperationKind::Help
        | OperationKind::Unknown => AccessClass::ReadOnly,
    }
}

/// Convenience for callers holding a whole intent
pub fn classify_intent(intent: &Intent) -> AccessClass {
    classify(intent.kind)
}
