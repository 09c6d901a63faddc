/// Peer identity constants
pub mod peer {
    /// Peer ID reserved for the server; also the controller of server-owned entities
    pub const SERVER_ID: i32 = 0;
    /// Marker for "no tracked ID", "no local index" and "no parent"
    pub const INVALID_ID: i32 = -1;
}

/// Registry sizing
pub mod registry {
    /// Registries grow by this many slots whenever an ID would exceed capacity
    pub const GROWTH_CHUNK: usize = 100;
}

/// Packet-ID layout shared by both dispatch tables
pub mod packet {
    /// Number of slots in each dispatch table
    pub const TABLE_SIZE: usize = 48;
    /// First ID of the per-kind operation blocks
    pub const KIND_BASE: i32 = 16;
    /// IDs reserved per entity kind
    pub const KIND_STRIDE: i32 = 8;
    /// Damage sub-index meaning "the entity as a whole"
    pub const WHOLE_ENTITY: u8 = 0xFF;
}

/// Network constants
pub mod net {
    /// Default TCP port; the datagram socket uses the same number unless configured
    pub const DEFAULT_PORT: u16 = 7861;
    /// Socket read buffer and maximum datagram size
    pub const DATA_BUFFER_SIZE: usize = 4096;
    /// Upper bound for a single reliable frame
    pub const MAX_FRAME_SIZE: usize = 1024 * 1024;
    /// Bytes of the length prefix (and of the datagram sender header)
    pub const HEADER_SIZE: usize = 4;
    /// Session tick rate in Hz
    pub const TICK_RATE: u32 = 20;
    /// Inbound work items buffered between ticks
    pub const INBOUND_QUEUE_CAPACITY: usize = 8192;
    /// Maximum simultaneous clients
    pub const MAX_CLIENTS: usize = 32;
    /// An update batch is closed once its payload passes this size
    pub const UPDATE_BATCH_BYTES: usize = 3072;
}
