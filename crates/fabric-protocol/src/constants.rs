/// Version of the registry query wire format.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Default overall time budget for a distributed query, in milliseconds.
pub const DEFAULT_TIMEOUT_BUDGET_MS: i64 = 15_000;

/// Default amount the budget shrinks by at every hop, in milliseconds.
pub const DEFAULT_BUDGET_DECREMENT_MS: i64 = 500;

/// How long a visited marker is remembered by a node.
pub const DEFAULT_DUPLICATE_WINDOW_SECS: u64 = 600;

/// Template for the per-node command topic. `{0}` is the node name.
pub const REGISTRY_COMMAND_TOPIC_DEFAULT: &str = "$fabric/{0}/$registry/$command";

/// Template for the per-node result topic. `{0}` is the node name.
pub const REGISTRY_RESULT_TOPIC_DEFAULT: &str = "$fabric/{0}/$registry/$results";

/// Wire action names.
pub const ACTION_QUERY: &str = "QUERY";
pub const ACTION_PARTIAL_RESULT: &str = "PARTIAL_RESULT";
pub const ACTION_FINAL_RESULT: &str = "FINAL_RESULT";
