/*!
 * System Limits and Constants
 *
 * Centralized location for sandbox-wide limits, thresholds, and magic numbers.
 * Organized by domain for maintainability and discoverability.
 *
 * - Security-critical constants are marked with [SECURITY]
 * - Performance-critical constants are marked with [PERF]
 */

const MIB: u64 = 1024 * 1024;

// =============================================================================
// TIME LIMITS
// =============================================================================

/// Default wall-clock budget per execution (30s)
pub const DEFAULT_MAX_EXECUTION_TIME_MS: u64 = 30_000;

/// Default CPU-time budget per execution (20s)
pub const DEFAULT_MAX_CPU_TIME_MS: u64 = 20_000;

/// Largest wall-clock budget a request may ask for (2 minutes)
pub const CEILING_EXECUTION_TIME_MS: u64 = 120_000;

/// Smallest wall-clock budget a request may ask for
pub const MIN_EXECUTION_TIME_MS: u64 = 10;

/// Timeout supervisor sampling period (1s)
pub const DEFAULT_TIMEOUT_SAMPLE_INTERVAL_MS: u64 = 1_000;

// =============================================================================
// MEMORY LIMITS
// =============================================================================

/// Default heap ceiling (128 MiB)
pub const DEFAULT_MAX_HEAP_BYTES: u64 = 128 * MIB;

/// Default resident-set ceiling (256 MiB)
pub const DEFAULT_MAX_RSS_BYTES: u64 = 256 * MIB;

/// Default external buffer ceiling (64 MiB)
pub const DEFAULT_MAX_BUFFER_BYTES: u64 = 64 * MIB;

/// Largest heap ceiling a request may ask for (512 MiB)
pub const CEILING_HEAP_BYTES: u64 = 512 * MIB;

/// Smallest heap ceiling a request may ask for (1 MiB)
pub const MIN_HEAP_BYTES: u64 = MIB;

/// Memory supervisor sampling period (500ms)
pub const DEFAULT_MEMORY_SAMPLE_INTERVAL_MS: u64 = 500;

/// Samples retained per execution
pub const MEMORY_SAMPLE_HISTORY: usize = 100;

/// Heap growth flagged as anomalous within the growth window (50 MiB)
pub const DEFAULT_GROWTH_THRESHOLD_BYTES: u64 = 50 * MIB;

/// Growth anomaly window (5s)
pub const DEFAULT_GROWTH_WINDOW_MS: u64 = 5_000;

/// Allocation hard stop as a multiple of the heap ceiling
/// [SECURITY] Bounds process-wide damage if the supervisor is late
pub const HARD_LIMIT_FACTOR: u64 = 2;

// =============================================================================
// SOURCE AND OUTPUT LIMITS
// =============================================================================

/// Source size above which the analyzer raises a finding (100 KiB)
pub const DEFAULT_MAX_SOURCE_BYTES: usize = 100 * 1024;

/// Captured output per execution (1 MiB)
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 1024 * 1024;

// =============================================================================
// INTERPRETER LIMITS
// =============================================================================

/// Maximum script call depth
/// [SECURITY] Keeps recursion well inside the unit thread's native stack
pub const MAX_CALL_DEPTH: usize = 200;

/// Native stack reserved for each execution unit thread
pub const UNIT_STACK_BYTES: usize = 64 * 1024 * 1024;

/// Maximum syntactic nesting accepted by the parser
pub const MAX_PARSE_DEPTH: usize = 256;

/// Array nesting followed by string conversion and `flat`
/// [SECURITY] Script-built nesting never reaches native recursion unbounded
pub const MAX_NESTING_DEPTH: usize = 512;

/// Interpreter steps between CPU clock publications
/// [PERF] clock_gettime per step would dominate tight loops
pub const CPU_PUBLISH_INTERVAL: u64 = 4_096;

/// Slice used while a unit waits for a timer, so halts stay prompt
pub const TIMER_WAIT_SLICE_MS: u64 = 10;

/// Pending timers per execution
pub const MAX_PENDING_TIMERS: usize = 10_000;

// =============================================================================
// COORDINATOR
// =============================================================================

/// How long shutdown waits for in-flight executions to drain
pub const SHUTDOWN_DRAIN_TIMEOUT_MS: u64 = 5_000;

/// Supervisor event channel capacity
pub const EVENT_CHANNEL_CAPACITY: usize = 256;
