// =============================================================================
// Application Identity
// =============================================================================

/// Application name in title case (for display)
pub const APP_NAME: &str = "Spanmold";

/// Application name in lowercase (for paths and log filters)
pub const APP_NAME_LOWER: &str = "spanmold";

/// Unix-style dotfile folder name
pub const APP_DOT_FOLDER: &str = ".spanmold";

// =============================================================================
// Configuration Files
// =============================================================================

/// Config file name, looked up in the profile folder and the working directory
pub const CONFIG_FILE_NAME: &str = "spanmold.json";

/// Environment variable for config file path
pub const ENV_CONFIG: &str = "SPANMOLD_CONFIG";

// =============================================================================
// Environment Variables - Logging
// =============================================================================

/// Environment variable for the log filter (falls back to RUST_LOG)
pub const ENV_LOG: &str = "SPANMOLD_LOG";

// =============================================================================
// Environment Variables - Rules
// =============================================================================

/// Environment variable for the rule directory
pub const ENV_RULES_DIR: &str = "SPANMOLD_RULES_DIR";

/// Environment variable for the compiled bundle path
pub const ENV_BUNDLE_PATH: &str = "SPANMOLD_BUNDLE_PATH";

/// Environment variable for the load mode (dev or prod)
pub const ENV_MODE: &str = "SPANMOLD_MODE";

/// Environment variable for the default transform budget
pub const ENV_TRANSFORM_BUDGET_US: &str = "SPANMOLD_TRANSFORM_BUDGET_US";

// =============================================================================
// Defaults
// =============================================================================

/// Compiled bundle file name inside the profile folder
pub const DEFAULT_BUNDLE_FILE: &str = "bundle.msgpack";
