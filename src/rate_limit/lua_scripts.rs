/// Lua script for a windowed counter
///
/// Increments the counter and, on the first increment of a window, sets its
/// expiry, so a crash between the two steps can never leave an immortal key.
///
/// KEYS[1] = the counter key
/// ARGV[1] = window duration (milliseconds)
///
/// Returns: post-increment counter value
pub const WINDOW_COUNTER_SCRIPT: &str = r#"
local key = KEYS[1]
local window = tonumber(ARGV[1])

local current = redis.call('INCR', key)
if current == 1 then
    redis.call('PEXPIRE', key, window)
end

return current
"#;

/// Lua script for fixed window admission
///
/// Same counter as `WINDOW_COUNTER_SCRIPT`, compared against the limit inside
/// the script so increment and decision are one indivisible step.
///
/// KEYS[1] = the rate limit key
/// ARGV[1] = maximum requests per window
/// ARGV[2] = window duration (milliseconds)
///
/// Returns: 1 when allowed, 0 when rejected
pub const WINDOW_LIMIT_SCRIPT: &str = r#"
local key = KEYS[1]
local max_requests = tonumber(ARGV[1])
local window = tonumber(ARGV[2])

local current = redis.call('INCR', key)
if current == 1 then
    redis.call('PEXPIRE', key, window)
end

if current > max_requests then
    return 0
end
return 1
"#;
