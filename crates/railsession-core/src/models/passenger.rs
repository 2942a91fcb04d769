use serde::{Deserialize, Serialize};
use tracing::warn;

/// Ticket category of a passenger, using the service's numeric codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PassengerType {
    Adult = 1,
    Child = 2,
    Student = 3,
    Soldier = 4,
}

impl PassengerType {
    pub fn from_code(code: &str) -> Option<Self> {
        match code.trim() {
            "1" => Some(PassengerType::Adult),
            "2" => Some(PassengerType::Child),
            "3" => Some(PassengerType::Student),
            "4" => Some(PassengerType::Soldier),
            _ => None,
        }
    }

    pub fn code(&self) -> u8 {
        *self as u8
    }

    pub fn label(&self) -> &'static str {
        match self {
            PassengerType::Adult => "Adult",
            PassengerType::Child => "Child",
            PassengerType::Student => "Student",
            PassengerType::Soldier => "Disabled soldier",
        }
    }
}

/// Roster entry as returned by the passenger-list endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Passenger {
    #[serde(default)]
    pub code: String,
    pub passenger_name: String,
    #[serde(default)]
    pub passenger_id_no: String,
    #[serde(default)]
    pub passenger_id_type_code: String,
    #[serde(default)]
    pub mobile_no: String,
    #[serde(default)]
    pub passenger_type: String,
    #[serde(rename = "allEncStr", default)]
    pub all_enc_str: String,
}

/// Result of one passenger-list request.
#[derive(Debug, Clone, Default)]
pub struct PassengerListing {
    pub passengers: Vec<Passenger>,
    /// Service-side explanation when the list came back empty.
    pub messages: Option<String>,
}

/// Passenger in the shape booking requests need.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PassengerRecord {
    pub name: String,
    pub id_card: String,
    pub id_card_type: String,
    pub mobile: String,
    pub passenger_type: PassengerType,
    pub type_text: String,
    pub enc_str: String,
}

impl PassengerRecord {
    /// Re-type the record, keeping `type_text` in sync.
    pub fn with_type(mut self, passenger_type: PassengerType) -> Self {
        self.passenger_type = passenger_type;
        self.type_text = passenger_type.label().to_string();
        self
    }
}

impl From<&Passenger> for PassengerRecord {
    fn from(p: &Passenger) -> Self {
        let passenger_type = PassengerType::from_code(&p.passenger_type).unwrap_or_else(|| {
            warn!(name = %p.passenger_name, code = %p.passenger_type, "Unknown passenger type, assuming adult");
            PassengerType::Adult
        });
        Self {
            name: p.passenger_name.clone(),
            id_card: p.passenger_id_no.clone(),
            id_card_type: p.passenger_id_type_code.clone(),
            mobile: p.mobile_no.clone(),
            passenger_type,
            type_text: passenger_type.label().to_string(),
            enc_str: p.all_enc_str.clone(),
        }
    }
}
