use serde::{Deserialize, Serialize};

/// Identifiers scoping everything this station produces
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StationIdentity {
    pub tenant_id: String,
    pub farm_id: String,
    pub barn_id: String,
    pub station_id: String,
    pub device_id: String,
}
