/// Error code registry for strata
///
/// Error codes are organized by category:
/// - 1000-1999: Configuration and strategy definition errors
/// - 4000-4999: Step execution errors
/// - 5000-5999: Job and orchestration errors
/// - 9000-9999: Other errors
pub struct ErrorCode;

impl ErrorCode {
    // Configuration and definition errors (1000-1999)
    pub const CONFIG_GENERIC: u16 = 1000;
    pub const CONFIG_NOT_FOUND: u16 = 1001;
    pub const CONFIG_PARSE_ERROR: u16 = 1002;
    pub const DEFINITION_INVALID: u16 = 1100;
    pub const DEFINITION_PARSE_ERROR: u16 = 1101;

    // Execution errors (4000-4999)
    pub const EXEC_ACTION_FAILED: u16 = 4000;
    pub const EXEC_ACTION_NOT_FOUND: u16 = 4001;
    pub const EXEC_DUPLICATE_ACTION: u16 = 4002;
    pub const EXEC_TIMEOUT: u16 = 4003;
    pub const EXEC_PARAMETER_RESOLUTION: u16 = 4010;
    pub const EXEC_CIRCULAR_REFERENCE: u16 = 4011;
    pub const EXEC_CHECKPOINT_ERROR: u16 = 4020;

    // Job errors (5000-5999)
    pub const JOB_STRATEGY_NOT_FOUND: u16 = 5001;
    pub const JOB_NOT_FOUND: u16 = 5002;
    pub const JOB_CANCELLED: u16 = 5003;
    pub const JOB_INVALID_TRANSITION: u16 = 5004;

    // Other errors (9000-9999)
    pub const OTHER_IO: u16 = 9001;
}

/// Get a human-readable description for an error code
pub fn describe_error_code(code: u16) -> &'static str {
    match code {
        1000 => "Generic configuration error",
        1001 => "Configuration file not found",
        1002 => "Failed to parse configuration",
        1100 => "Strategy definition is invalid",
        1101 => "Strategy definition could not be parsed",

        4000 => "Action execution failed",
        4001 => "Action type is not registered",
        4002 => "Action type registered twice",
        4003 => "Execution timed out",
        4010 => "Parameter reference could not be resolved",
        4011 => "Parameter references form a cycle",
        4020 => "Chunk checkpoint could not be read or written",

        5001 => "Strategy not found",
        5002 => "Job not found",
        5003 => "Job was cancelled",
        5004 => "Illegal job state transition",

        9001 => "I/O error",
        _ => "Unknown error code",
    }
}
