// Network registry module - the core of the multiplexing daemon.
// NetId handles, fwmark policy, per-variant network state, and the
// thread-safe registry that arbitrates which network each uid may use.

pub mod controller;
pub mod error;
pub mod fwmark;
pub mod network;
pub mod permission;
pub mod physical;
pub mod routes;
pub mod uid_ranges;
pub mod vpn;

pub use controller::{NetworkContext, NetworkController};
pub use error::{NetError, NetResult};
pub use fwmark::Fwmark;
pub use permission::Permission;
pub use uid_ranges::{UidRange, UidRanges};

/// Opaque 16-bit handle for a logical network.
pub type NetId = u16;

/// Placeholder meaning "no network selected".
pub const NETID_UNSET: NetId = 0;

/// Fixed netId of the dummy placeholder network.
pub const DUMMY_NET_ID: NetId = 51;

/// Fixed netId of the unreachable sentinel network. Absorbs traffic from
/// uids configured to have no default network.
pub const UNREACHABLE_NET_ID: NetId = 52;

/// Fixed netId of the local (LAN/tethering) pseudo-network.
pub const LOCAL_NET_ID: NetId = 99;

/// Smallest netId the connectivity service may assign.
pub const MIN_NET_ID: NetId = 100;
pub const MAX_NET_ID: NetId = 65535;

/// Auto-allocated OEM network ids live in their own small range below the
/// general one so they can never collide with service-assigned ids.
pub const MIN_OEM_ID: NetId = 60;
pub const MAX_OEM_ID: NetId = 69;

pub type Uid = u32;

/// Peer uid when SO_PEERCRED retrieval failed.
pub const INVALID_UID: Uid = u32::MAX;

/// Uids below this belong to system components and default to SYSTEM
/// permission unless explicitly overridden.
pub const FIRST_APPLICATION_UID: Uid = 10000;

/// The platform VPN daemon. Always allowed to protect its own sockets.
pub const VPN_UID: Uid = 1016;
