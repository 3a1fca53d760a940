//! Consensus and policy constants for the Aurum chain.
//!
//! Values that the chain configuration may legitimately vary per network
//! (activation height, subsidy schedule, lottery calibration) live in
//! [`crate::config::ChainParams`] instead.

/// Base monetary unit: 1 AUR = 100,000,000 units.
pub const COIN: i64 = 100_000_000;

/// 0.01 AUR.
pub const CENT: i64 = 1_000_000;

/// Maximum money supply in base units.
pub const MAX_MONEY: i64 = 1_172_245_700 * COIN;

/// Maximum serialized block size: 32 MB.
pub const MAX_BLOCK_SIZE: usize = 32_000_000;

/// Maximum serialized transaction size: 1 MB.
pub const MAX_TX_SIZE: usize = 1_000_000;

/// Maximum wire message payload, also the decode guard of the codec: 32 MiB.
pub const MAX_MESSAGE_SIZE: usize = 32 * 1024 * 1024;

/// Maximum number of inputs per transaction.
pub const MAX_INPUTS: usize = 1000;

/// Maximum number of outputs per transaction.
pub const MAX_OUTPUTS: usize = 1000;

/// Maximum script length.
pub const MAX_SCRIPT_SIZE: usize = 10_000;

/// Maximum stack size during script execution.
pub const MAX_STACK_SIZE: usize = 1000;

/// Maximum number of non-push operations per script.
pub const MAX_SCRIPT_OPS: usize = 201;

/// Maximum public keys in a CHECKMULTISIG.
pub const MAX_MULTISIG_KEYS: usize = 20;

/// Blocks a coinbase output must wait before it can be spent.
pub const COINBASE_MATURITY: u64 = 100;

/// Headers sampled for the median-time-past rule (inclusive of self).
pub const MEDIAN_TIME_SPAN: usize = 11;

/// Maximum tolerated clock drift for incoming block timestamps: 2 hours.
pub const MAX_FUTURE_DRIFT_SECS: u64 = 2 * 60 * 60;

/// How far behind its parent a producer-authored block may be stamped: 24 hours.
pub const PRODUCER_TIME_SLACK_SECS: u64 = 24 * 60 * 60;

/// Target spacing between blocks.
pub const BLOCK_TIME_SECS: u64 = 120;

/// Minimum stake to enter the participation lottery.
pub const MIN_STAKE: i64 = 1000 * COIN;

/// Confirmations before a stake-locking output counts as mature.
pub const STAKE_MATURITY: u64 = 1440;

/// Stake age (in maturities) after which a participant bypasses subnet caps.
pub const VETERAN_MATURITY_FACTOR: u64 = 10;

/// Participant cap per clustered subnet.
pub const MAX_NODES_PER_SUBNET: usize = 2;

/// Subnet density above which the class escalates from /24 to /20.
pub const SUBNET_ESCALATE_20: usize = 3;

/// Subnet density above which the class escalates to /16.
pub const SUBNET_ESCALATE_16: usize = 10;

/// Priority above which a transaction rides for free (Satoshi's formula:
/// one coin-day of a 1 AUR input in a 250-byte transaction).
pub const FREE_PRIORITY_THRESHOLD: f64 = 57_600_000.0;

/// Share of the block byte budget reserved for free-eligible transactions.
pub const FREE_ZONE_NUMERATOR: usize = 5;
pub const FREE_ZONE_DENOMINATOR: usize = 100;

/// Minimum relay fee per started kilobyte for non-free transactions.
pub const MIN_RELAY_FEE_PER_KB: i64 = 100_000;

/// Mempool byte budget before lowest-fee eviction kicks in.
pub const MAX_MEMPOOL_SIZE: usize = 300_000_000;

/// Mempool utilization (percent) under which the relay fee is waived.
pub const LOW_PRESSURE_UTILIZATION_PCT: usize = 10;

/// Maximum resident orphan transactions.
pub const MAX_ORPHAN_TX: usize = 100;

/// Seconds an orphan may wait for its parents before eviction.
pub const ORPHAN_TTL_SECS: u64 = 20 * 60;

/// Producer lottery check cadence.
pub const PRODUCER_TICK_SECS: u64 = 2;

/// Cumulative-weight contribution of one post-activation block. Chosen to
/// dominate any compact-bits work a legacy tail can accumulate.
pub const PARTICIPATION_BLOCK_WEIGHT: u128 = 1 << 96;

/// Network magic: "AURM".
pub const NETWORK_MAGIC: [u8; 4] = [0x41, 0x55, 0x52, 0x4d];

/// Width of the null-padded ASCII command field in a frame.
pub const COMMAND_SIZE: usize = 12;

/// Wire protocol version advertised in `version`.
pub const PROTOCOL_VERSION: u32 = 70001;

/// Oldest protocol version this node will talk to.
pub const MIN_PROTO_VERSION: u32 = 70001;

/// Default peer-to-peer listen port.
pub const DEFAULT_PORT: u16 = 8171;

/// Default RPC port.
pub const DEFAULT_RPC_PORT: u16 = 8172;

/// Silence threshold after which a peer is disconnected.
pub const PEER_TIMEOUT_SECS: u64 = 90;

/// Send-side idle interval before a keepalive ping.
pub const PING_INTERVAL_SECS: u64 = 30;

/// How long a misbehaving peer stays banned.
pub const BAN_DURATION_SECS: u64 = 24 * 60 * 60;

/// Ceiling on concurrent peer connections.
pub const MAX_CONNECTIONS: usize = 125;

/// Bounded capacity of the known-address pool.
pub const MAX_ADDR_POOL: usize = 2048;

/// Depth of the bounded per-peer outbound message queue.
pub const SEND_QUEUE_DEPTH: usize = 128;

/// Sequence number marking an input final.
pub const SEQUENCE_FINAL: u32 = 0xffff_ffff;

/// Lock times below this threshold are block heights, above it unix times.
pub const LOCKTIME_THRESHOLD: u32 = 500_000_000;
