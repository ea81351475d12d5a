use serde::{Deserialize, Serialize};
use std::fmt::Display;

/// Wire-schema families a request or backend can speak.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiSchema {
    #[serde(rename = "OpenAI")]
    OpenAi,
    #[serde(rename = "AWSBedrock")]
    AwsBedrock,
}

impl Display for ApiSchema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiSchema::OpenAi => write!(f, "OpenAI"),
            ApiSchema::AwsBedrock => write!(f, "AWSBedrock"),
        }
    }
}
