use anyhow::bail;


#[derive(Debug, Clone, Eq, PartialEq)]
pub struct GateConfig {
    /// the host other gates use to reach this gate - it becomes part of the gate's address
    pub ip: String,
    pub port: u16,

    /// upper bound for the number of messages read from a single socket in one poll call. This
    ///  keeps a single chatty peer from starving everyone else.
    pub max_per_poll: usize,

    /// maximum number of messages that may be waiting for delivery to a single peer. Sends beyond
    ///  this limit are dropped (and reported as such) rather than queued.
    pub high_water_mark: usize,
}

impl GateConfig {
    pub const DEFAULT_MAX_PER_POLL: usize = 100;
    pub const DEFAULT_HIGH_WATER_MARK: usize = 1000;

    pub fn new(ip: impl Into<String>, port: u16) -> GateConfig {
        GateConfig {
            ip: ip.into(),
            port,
            max_per_poll: Self::DEFAULT_MAX_PER_POLL,
            high_water_mark: Self::DEFAULT_HIGH_WATER_MARK,
        }
    }

    pub fn with_max_per_poll(self, max_per_poll: usize) -> GateConfig {
        GateConfig {
            max_per_poll,
            ..self
        }
    }

    pub fn with_high_water_mark(self, high_water_mark: usize) -> GateConfig {
        GateConfig {
            high_water_mark,
            ..self
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.ip.is_empty() {
            bail!("ip must not be empty");
        }
        if self.max_per_poll == 0 {
            bail!("max_per_poll must be positive");
        }
        if self.high_water_mark == 0 {
            bail!("high_water_mark must be positive");
        }
        Ok(())
    }

    /// the endpoint the gate's receiving socket listens on: all interfaces
    pub fn bind_endpoint(&self) -> String {
        format!("tcp://*:{}", self.port)
    }

    /// the gate's address, i.e. the endpoint other gates connect to
    pub fn connect_endpoint(&self) -> String {
        format!("tcp://{}:{}", self.ip, self.port)
    }
}
