//! Queue sizing for pumps, clients and servers.

/// Default capacity of every bounded queue
pub const DEFAULT_CAPACITY: usize = 10;

/// Default size of a single read from the byte source
pub const DEFAULT_READ_BUFFER: usize = 8 * 1024;

/// Sizing for a single pump
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PumpConfig {
    /// Capacity of the message queue and of the error queue
    pub capacity: usize,
    /// Bytes requested per read from the source (readers only)
    pub read_buffer: usize,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            read_buffer: DEFAULT_READ_BUFFER,
        }
    }
}

impl PumpConfig {
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_read_buffer(mut self, read_buffer: usize) -> Self {
        self.read_buffer = read_buffer;
        self
    }

    /// Tokio channels reject a zero capacity.
    pub(crate) fn queue_capacity(&self) -> usize {
        self.capacity.max(1)
    }

    pub(crate) fn read_buffer_size(&self) -> usize {
        self.read_buffer.max(1)
    }
}

/// Caller-side configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientConfig {
    /// Pump decoding replies
    pub reader: PumpConfig,
    /// Pump encoding calls
    pub writer: PumpConfig,
    /// Calls that may wait for the dispatch loop before `call` reports backpressure
    pub scheduling_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            reader: PumpConfig::default(),
            writer: PumpConfig::default(),
            scheduling_capacity: DEFAULT_CAPACITY,
        }
    }
}

impl ClientConfig {
    pub fn with_reader(mut self, reader: PumpConfig) -> Self {
        self.reader = reader;
        self
    }

    pub fn with_writer(mut self, writer: PumpConfig) -> Self {
        self.writer = writer;
        self
    }

    pub fn with_scheduling_capacity(mut self, capacity: usize) -> Self {
        self.scheduling_capacity = capacity;
        self
    }
}

/// Responder-side configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerConfig {
    /// Pump decoding calls
    pub reader: PumpConfig,
    /// Pump encoding replies
    pub writer: PumpConfig,
}

impl ServerConfig {
    pub fn with_reader(mut self, reader: PumpConfig) -> Self {
        self.reader = reader;
        self
    }

    pub fn with_writer(mut self, writer: PumpConfig) -> Self {
        self.writer = writer;
        self
    }
}
