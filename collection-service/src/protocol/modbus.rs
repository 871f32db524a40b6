use std::net::SocketAddr;

use meter_client::domain::{Endpoint, ProtocolKind, RegisterMapping};
use tokio_modbus::prelude::*;

use super::{DeviceConnection, DeviceTransport, ProtocolError};

/// Protocol limit on words per read-holding-registers request.
pub const MAX_READ_WORDS: u32 = 125;

/// Modbus TCP over `tokio-modbus`. One connection serves every unit id
/// behind the endpoint; the slave id is switched per read.
#[derive(Debug, Default, Clone)]
pub struct ModbusTcpTransport;

async fn resolve(endpoint: &Endpoint) -> Result<SocketAddr, ProtocolError> {
    tokio::net::lookup_host((endpoint.host.as_str(), endpoint.port))
        .await
        .map_err(|e| ProtocolError::Transport(format!("failed to resolve {endpoint}: {e}")))?
        .next()
        .ok_or_else(|| ProtocolError::Transport(format!("no address for {endpoint}")))
}

#[async_trait::async_trait]
impl DeviceTransport for ModbusTcpTransport {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn DeviceConnection>, ProtocolError> {
        if endpoint.protocol != ProtocolKind::Modbus {
            return Err(ProtocolError::Unsupported(endpoint.protocol.as_str()));
        }

        let addr = resolve(endpoint).await?;
        let ctx = tcp::connect(addr)
            .await
            .map_err(|e| ProtocolError::Transport(format!("failed to connect to {endpoint}: {e}")))?;
        tracing::debug!(endpoint = %endpoint, "modbus tcp connected");

        Ok(Box::new(ModbusTcpConnection { ctx: Some(ctx) }))
    }
}

pub struct ModbusTcpConnection {
    ctx: Option<client::Context>,
}

/// One read request covering `count` words starting at `start`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Span {
    pub start: u16,
    pub count: u16,
    /// Indices into the register slice served by this span.
    pub members: Vec<usize>,
}

/// Group registers into as few contiguous read requests as possible.
///
/// A register joins the current span when it starts at or after the span
/// start and the span would still fit in [`MAX_READ_WORDS`].
pub fn plan_spans(registers: &[RegisterMapping]) -> Vec<Span> {
    let mut spans: Vec<Span> = Vec::new();

    for (idx, reg) in registers.iter().enumerate() {
        let end = reg.end_address();
        if let Some(span) = spans.last_mut() {
            let start = u32::from(span.start);
            let span_end = start + u32::from(span.count) - 1;
            if u32::from(reg.address) >= start && end - start < MAX_READ_WORDS {
                span.count = (end.max(span_end) - start + 1) as u16;
                span.members.push(idx);
                continue;
            }
        }
        spans.push(Span {
            start: reg.address,
            count: reg.data_type.word_count(),
            members: vec![idx],
        });
    }

    spans
}

/// Copy each member's words out of a span response. A short response
/// leaves the member empty so it fails decoding on its own.
fn distribute(registers: &[RegisterMapping], span: &Span, words: &[u16], out: &mut [Vec<u16>]) {
    for &idx in &span.members {
        let reg = &registers[idx];
        let offset = usize::from(reg.address - span.start);
        let len = usize::from(reg.data_type.word_count());
        out[idx] = words.get(offset..offset + len).map(<[u16]>::to_vec).unwrap_or_default();
    }
}

#[async_trait::async_trait]
impl DeviceConnection for ModbusTcpConnection {
    async fn read_registers(
        &mut self,
        unit_id: u8,
        registers: &[RegisterMapping],
    ) -> Result<Vec<Vec<u16>>, ProtocolError> {
        let ctx = self
            .ctx
            .as_mut()
            .ok_or_else(|| ProtocolError::Transport("connection closed".to_string()))?;
        ctx.set_slave(Slave(unit_id));

        let mut out = vec![Vec::new(); registers.len()];
        for span in plan_spans(registers) {
            let words = ctx
                .read_holding_registers(span.start, span.count)
                .await
                .map_err(|e| {
                    ProtocolError::Transport(format!(
                        "read of {} words at {} failed: {e}",
                        span.count, span.start
                    ))
                })?;
            distribute(registers, &span, &words, &mut out);
        }

        Ok(out)
    }

    async fn close(&mut self) {
        // dropping the context closes the socket
        self.ctx = None;
    }
}
