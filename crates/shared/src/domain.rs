use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_newtype!(LoadId);
id_newtype!(DriverId);

/// Dispatch stage of a load. Each variant is one board column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadStatus {
    Available,
    Assigned,
    InTransit,
    Delivered,
}

impl LoadStatus {
    /// Board column order.
    pub const ALL: [LoadStatus; 4] = [
        LoadStatus::Available,
        LoadStatus::Assigned,
        LoadStatus::InTransit,
        LoadStatus::Delivered,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            LoadStatus::Available => "available",
            LoadStatus::Assigned => "assigned",
            LoadStatus::InTransit => "in_transit",
            LoadStatus::Delivered => "delivered",
        }
    }
}

impl fmt::Display for LoadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown load status '{0}'; expected one of available, assigned, in_transit, delivered")]
pub struct ParseLoadStatusError(pub String);

impl FromStr for LoadStatus {
    type Err = ParseLoadStatusError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let normalized = raw.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        match normalized.as_str() {
            "available" => Ok(LoadStatus::Available),
            "assigned" => Ok(LoadStatus::Assigned),
            "in_transit" | "intransit" => Ok(LoadStatus::InTransit),
            "delivered" => Ok(LoadStatus::Delivered),
            _ => Err(ParseLoadStatusError(raw.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Load {
    pub id: LoadId,
    pub status: LoadStatus,
    pub pickup_address: String,
    pub delivery_address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_amount: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver_id: Option<DriverId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broker_name: Option<String>,
}

impl Load {
    /// An available load never carries a driver.
    pub fn is_consistent(&self) -> bool {
        !(self.status == LoadStatus::Available && self.driver_id.is_some())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Driver {
    pub id: DriverId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchStats {
    pub available_loads: u32,
    pub assigned_loads: u32,
    pub in_transit_loads: u32,
    pub delivered_today: u32,
    pub available_drivers: u32,
    pub available_trucks: u32,
}
