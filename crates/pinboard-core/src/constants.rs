//! Shared constants for device management.
//!
//! Values here are used by more than one crate: rate-limiter windows, trigger
//! names understood by host automation rules, and daemon defaults.

use std::time::Duration;

// ============================================================================
// Trigger rate limiting
// ============================================================================

/// Firings of the same event name closer together than this are suppressed.
pub const TRIGGER_SUPPRESS_WINDOW: Duration = Duration::from_secs(10);

/// A quiet period of at least this long clears the limiting flag.
pub const TRIGGER_RECOVERY_WINDOW: Duration = Duration::from_secs(300);

// ============================================================================
// Trigger names
// ============================================================================

/// Event type fired by the standard error report.
pub const TRIGGER_DEVICE_ERROR: &str = "pigpioError";

/// Event type fired on the rising edge of a limit fault.
pub const TRIGGER_LIMIT_FAULT: &str = "limitFault";

/// Event name for a low limit fault.
pub const EVENT_LOW_LIMIT: &str = "lowLimit";

/// Event name for a high limit fault.
pub const EVENT_HIGH_LIMIT: &str = "highLimit";

// ============================================================================
// Daemon defaults
// ============================================================================

/// Default TCP port of the remote GPIO daemon.
pub const DEFAULT_DAEMON_PORT: u16 = 8889;

/// File read once per connection to identify the host board.
pub const HOST_MODEL_PATH: &str = "/proc/device-tree/model";

/// Board model prefix whose header pins live on gpiochip4.
pub const PI5_MODEL_MARKER: &str = "Raspberry Pi 5";

/// GPIO chip number for the header pins of a Raspberry Pi 5.
pub const PI5_GPIO_CHIP: u32 = 4;

/// GPIO chip number for the header pins of every other supported board.
pub const DEFAULT_GPIO_CHIP: u32 = 0;

// ============================================================================
// Scheduling and state processing
// ============================================================================

/// Default sleep between poll passes of the scheduler.
pub const DEFAULT_POLL_PERIOD: Duration = Duration::from_millis(500);

/// Denominator used for change detection when the prior value is zero.
pub const CHANGE_EPSILON: f64 = 1e-6;

/// Default relay-master watchdog window in milliseconds.
pub const DEFAULT_WATCHDOG_MS: u32 = 500;

