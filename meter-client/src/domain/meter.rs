use std::{fmt, str::FromStr};

use time::OffsetDateTime;

use super::UnknownVariant;

/// Field protocol spoken by a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum ProtocolKind {
    Modbus,
    Bacnet,
}

impl ProtocolKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Modbus => "modbus",
            Self::Bacnet => "bacnet",
        }
    }
}

impl FromStr for ProtocolKind {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "modbus" | "modbus_tcp" => Ok(Self::Modbus),
            "bacnet" | "bacnet_ip" => Ok(Self::Bacnet),
            other => Err(UnknownVariant {
                kind: "protocol",
                value: other.to_string(),
            }),
        }
    }
}

/// Network endpoint of a device or gateway.
///
/// Several device addresses (elements behind one gateway) can share an
/// endpoint; all traffic to one endpoint is serialized.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub protocol: ProtocolKind,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.protocol.as_str(), self.host, self.port)
    }
}

/// Full address of a readable unit on a device.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceAddress {
    pub host: String,
    pub port: u16,
    pub protocol: ProtocolKind,
    /// Modbus unit id / BACnet device instance low byte.
    pub unit_id: u8,
}

impl DeviceAddress {
    pub fn endpoint(&self) -> Endpoint {
        Endpoint {
            host: self.host.clone(),
            port: self.port,
            protocol: self.protocol,
        }
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}://{}:{}/{}",
            self.protocol.as_str(),
            self.host,
            self.port,
            self.unit_id
        )
    }
}

/// Identity of one independent read unit: a (meter, element) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MeterKey {
    pub meter_id: i64,
    pub element_id: i64,
}

impl fmt::Display for MeterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.meter_id, self.element_id)
    }
}

/// One meter element as the collector sees it.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Meter {
    pub meter_id: i64,
    pub tenant_id: i64,
    pub element_id: i64,
    pub name: String,
    pub device: DeviceAddress,
    pub active: bool,
    #[cfg_attr(feature = "serde", serde(with = "time::serde::rfc3339::option"))]
    pub last_read_at: Option<OffsetDateTime>,
}

impl Meter {
    pub fn key(&self) -> MeterKey {
        MeterKey {
            meter_id: self.meter_id,
            element_id: self.element_id,
        }
    }
}

/// Flat row shape of the `meters` / `meter_elements` join.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MeterRow {
    pub meter_id: i64,
    pub tenant_id: i64,
    pub element_id: i64,
    pub name: String,
    pub host: String,
    pub port: i32,
    pub protocol: String,
    pub unit_id: i16,
    pub active: bool,
    pub last_read_at: Option<OffsetDateTime>,
}

impl TryFrom<MeterRow> for Meter {
    type Error = UnknownVariant;

    fn try_from(row: MeterRow) -> Result<Self, Self::Error> {
        let protocol: ProtocolKind = row.protocol.parse()?;
        let port = u16::try_from(row.port).map_err(|_| UnknownVariant {
            kind: "port",
            value: row.port.to_string(),
        })?;
        let unit_id = u8::try_from(row.unit_id).map_err(|_| UnknownVariant {
            kind: "unit id",
            value: row.unit_id.to_string(),
        })?;

        Ok(Meter {
            meter_id: row.meter_id,
            tenant_id: row.tenant_id,
            element_id: row.element_id,
            name: row.name,
            device: DeviceAddress {
                host: row.host,
                port,
                protocol,
                unit_id,
            },
            active: row.active,
            last_read_at: row.last_read_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row() -> MeterRow {
        MeterRow {
            meter_id: 7,
            tenant_id: 1,
            element_id: 2,
            name: "main incomer".to_string(),
            host: "10.0.0.5".to_string(),
            port: 502,
            protocol: "Modbus".to_string(),
            unit_id: 3,
            active: true,
            last_read_at: None,
        }
    }

    #[test]
    fn meter_row_converts_into_meter() {
        let meter = Meter::try_from(row()).unwrap();
        assert_eq!(meter.device.protocol, ProtocolKind::Modbus);
        assert_eq!(meter.device.to_string(), "modbus://10.0.0.5:502/3");
        assert_eq!(meter.key(), MeterKey { meter_id: 7, element_id: 2 });
    }

    #[test]
    fn meter_row_rejects_unknown_protocol_and_bad_port() {
        let mut r = row();
        r.protocol = "dnp3".to_string();
        assert!(Meter::try_from(r).is_err());

        let mut r = row();
        r.port = 70_000;
        assert!(Meter::try_from(r).is_err());
    }

    #[test]
    fn elements_behind_one_gateway_share_an_endpoint() {
        let a = Meter::try_from(row()).unwrap();
        let mut r = row();
        r.element_id = 3;
        r.unit_id = 4;
        let b = Meter::try_from(r).unwrap();

        assert_ne!(a.device, b.device);
        assert_eq!(a.device.endpoint(), b.device.endpoint());
    }
}
