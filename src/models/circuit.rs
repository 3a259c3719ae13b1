use serde::{Deserialize, Serialize};

/// Status of one anonymity-network circuit as reported by the daemon
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CircuitStatus {
    Built,
    Building,
    Failed,
    Closed,
}

impl CircuitStatus {
    /// Map a control-protocol status keyword
    pub fn from_keyword(keyword: &str) -> Option<Self> {
        match keyword {
            "BUILT" => Some(CircuitStatus::Built),
            "LAUNCHED" | "EXTENDED" | "GUARD_WAIT" => Some(CircuitStatus::Building),
            "FAILED" => Some(CircuitStatus::Failed),
            "CLOSED" => Some(CircuitStatus::Closed),
            _ => None,
        }
    }
}

/// One entry of the daemon's circuit listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Circuit {
    pub id: String,
    pub status: CircuitStatus,
    pub path: Vec<String>,
    pub purpose: Option<String>,
}

/// Summary of the first built circuit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitSummary {
    pub id: String,
    pub purpose: Option<String>,
    pub path_length: usize,
}

/// Circuit counts by status
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitInfo {
    pub built: usize,
    pub building: usize,
    pub failed: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_built: Option<CircuitSummary>,
}

impl CircuitInfo {
    pub fn from_circuits(circuits: &[Circuit]) -> Self {
        let mut info = CircuitInfo::default();

        for circuit in circuits {
            match circuit.status {
                CircuitStatus::Built => {
                    info.built += 1;
                    if info.first_built.is_none() {
                        info.first_built = Some(CircuitSummary {
                            id: circuit.id.clone(),
                            purpose: circuit.purpose.clone(),
                            path_length: circuit.path.len(),
                        });
                    }
                }
                CircuitStatus::Building => info.building += 1,
                CircuitStatus::Failed => info.failed += 1,
                CircuitStatus::Closed => {}
            }
        }

        info
    }

    pub fn is_empty(&self) -> bool {
        *self == CircuitInfo::default()
    }
}
