use crate::error::{ManagerError, Result};
use std::collections::HashMap;
use system_utils::net::port_is_bindable;

pub const DEFAULT_RANGE_START: u16 = 60000;
pub const DEFAULT_RANGE_END: u16 = 65535;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PortRange {
    start: u16,
    end: u16,
}

impl PortRange {
    pub fn new(start: u16, end: u16) -> std::result::Result<Self, String> {
        if start == 0 {
            return Err("port range cannot start at 0".to_string());
        }
        if start > end {
            return Err(format!("port range start {start} is above end {end}"));
        }
        Ok(Self { start, end })
    }

    pub fn start(&self) -> u16 {
        self.start
    }

    pub fn end(&self) -> u16 {
        self.end
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            start: DEFAULT_RANGE_START,
            end: DEFAULT_RANGE_END,
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct PortRequest {
    /// Port the user picked explicitly.
    pub preferred: Option<u16>,
    /// Port used by the previous session; taken only if it is still free.
    pub hint: Option<u16>,
    /// User confirmed a preferred port outside the range.
    pub allow_out_of_range: bool,
}

pub struct PortAllocator {
    range: PortRange,
    bind_host: String,
    limit: u32,
    assigned: HashMap<u16, String>,
}

impl PortAllocator {
    pub fn new(range: PortRange, bind_host: impl Into<String>, limit: u32) -> Self {
        Self {
            range,
            bind_host: bind_host.into(),
            limit,
            assigned: HashMap::new(),
        }
    }

    pub fn range(&self) -> PortRange {
        self.range
    }

    pub fn set_limit(&mut self, limit: u32) {
        self.limit = limit;
    }

    pub fn assigned_count(&self) -> usize {
        self.assigned.len()
    }

    pub fn owner_of(&self, port: u16) -> Option<&str> {
        self.assigned.get(&port).map(String::as_str)
    }

    /// Reserves a port for `owner`. The reservation holds until [`release`](Self::release).
    pub fn allocate(&mut self, owner: &str, request: PortRequest) -> Result<u16> {
        if self.limit > 0 && self.assigned.len() >= self.limit as usize {
            return Err(ManagerError::NoFreePort(format!(
                "connection limit {} reached",
                self.limit
            )));
        }

        if let Some(port) = request.preferred {
            return self.allocate_preferred(owner, port, request.allow_out_of_range);
        }

        if let Some(port) = request.hint {
            if self.range.contains(port) && self.is_free(port) {
                self.assigned.insert(port, owner.to_string());
                return Ok(port);
            }
        }

        for port in self.range.start..=self.range.end {
            if self.is_free(port) {
                self.assigned.insert(port, owner.to_string());
                return Ok(port);
            }
        }
        Err(ManagerError::NoFreePort(format!(
            "range {}-{} exhausted",
            self.range.start, self.range.end
        )))
    }

    pub fn release(&mut self, port: u16) -> Option<String> {
        self.assigned.remove(&port)
    }

    /// Unassigned in-range ports, lowest first, without probing the OS.
    pub fn available(&self, max: usize) -> Vec<u16> {
        (self.range.start..=self.range.end)
            .filter(|port| !self.assigned.contains_key(port))
            .take(max)
            .collect()
    }

    fn allocate_preferred(&mut self, owner: &str, port: u16, allow_out_of_range: bool) -> Result<u16> {
        if port == 0 {
            return Err(ManagerError::PortOutOfRange {
                port,
                start: self.range.start,
                end: self.range.end,
            });
        }
        if !self.range.contains(port) && !allow_out_of_range {
            return Err(ManagerError::PortOutOfRange {
                port,
                start: self.range.start,
                end: self.range.end,
            });
        }
        match self.assigned.get(&port) {
            Some(current) if current == owner => return Ok(port),
            Some(current) => {
                return Err(ManagerError::PortConflict {
                    port,
                    owner: current.clone(),
                })
            }
            None => {}
        }
        if !port_is_bindable(&self.bind_host, port) {
            return Err(ManagerError::PortUnavailable(port));
        }
        self.assigned.insert(port, owner.to_string());
        Ok(port)
    }

    fn is_free(&self, port: u16) -> bool {
        !self.assigned.contains_key(&port) && port_is_bindable(&self.bind_host, port)
    }
}
