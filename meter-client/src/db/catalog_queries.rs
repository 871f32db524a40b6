use anyhow::{Context, Result};
use sqlx::PgPool;

use crate::domain::{
    meter::MeterRow, register::RegisterRow, DeviceAddress, Meter, RegisterMapping,
};

/// Fetch every active meter element together with its device address.
pub async fn active_meters(pool: &PgPool) -> Result<Vec<Meter>> {
    let rows = sqlx::query_as::<_, MeterRow>(
        r#"
        SELECT
            m.meter_id,
            m.tenant_id,
            e.element_id,
            m.name,
            d.host,
            d.port,
            d.protocol,
            e.unit_id,
            (m.active AND e.active) AS active,
            e.last_read_at
        FROM meters m
        JOIN meter_elements e ON e.meter_id = m.meter_id
        JOIN devices d ON d.device_id = m.device_id
        WHERE m.active AND e.active
        ORDER BY m.meter_id, e.element_id
        "#,
    )
    .fetch_all(pool)
    .await?;

    rows.into_iter()
        .map(|row| {
            let meter_id = row.meter_id;
            Meter::try_from(row).with_context(|| format!("invalid meter row {meter_id}"))
        })
        .collect()
}

/// Fetch register mappings for all devices that have an active element,
/// in register order per device address.
pub async fn register_mappings(pool: &PgPool) -> Result<Vec<(DeviceAddress, RegisterMapping)>> {
    let rows = sqlx::query_as::<_, RegisterRow>(
        r#"
        SELECT DISTINCT
            d.host,
            d.port,
            d.protocol,
            r.unit_id,
            r.register_address,
            r.data_point,
            r.data_type,
            r.scale,
            r.unit
        FROM register_mappings r
        JOIN devices d ON d.device_id = r.device_id
        JOIN meters m ON m.device_id = d.device_id
        JOIN meter_elements e ON e.meter_id = m.meter_id AND e.unit_id = r.unit_id
        WHERE m.active AND e.active
        ORDER BY d.host, d.port, r.unit_id, r.register_address
        "#,
    )
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(register_from_row).collect()
}

fn register_from_row(row: RegisterRow) -> Result<(DeviceAddress, RegisterMapping)> {
    let address = DeviceAddress {
        host: row.host,
        port: u16::try_from(row.port).with_context(|| format!("invalid port {}", row.port))?,
        protocol: row.protocol.parse()?,
        unit_id: u8::try_from(row.unit_id)
            .with_context(|| format!("invalid unit id {}", row.unit_id))?,
    };

    let mapping = RegisterMapping {
        address: u16::try_from(row.register_address)
            .with_context(|| format!("invalid register address {}", row.register_address))?,
        data_type: row.data_type.parse()?,
        data_point: row.data_point,
        scale: row.scale,
        unit: row.unit,
    };

    Ok((address, mapping))
}
