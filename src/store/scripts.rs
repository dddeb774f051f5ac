//! Lua scripts: one atomic script per queue state transition.
//!
//! Every script takes the prefixed namespace as `ARGV[1]` and derives its
//! keys from it (see [`super::keys::Keys`]). Scripts share a prelude that
//! re-inserts a group into the ready index behind its current head.

use redis::Script;

use super::MAX_SCORE_MS;
use super::keys::SIGNAL_CAP;

/// Helpers available to every script.
///
/// `advance` puts a group back into the ready index scored by its head job
/// and wakes one blocked worker, or unregisters the group when it is empty.
const PRELUDE: &str = r#"
local SIGNAL_CAP = __SIGNAL_CAP__
local MAX_MS = __MAX_MS__

local function signal(ns)
  redis.call("LPUSH", ns .. ":signal", "1")
  redis.call("LTRIM", ns .. ":signal", 0, SIGNAL_CAP - 1)
end

local function advance(ns, gid)
  local head = redis.call("ZRANGE", ns .. ":g:" .. gid, 0, 0, "WITHSCORES")
  if #head >= 2 then
    redis.call("ZADD", ns .. ":ready", head[2], gid)
    signal(ns)
  else
    redis.call("SREM", ns .. ":groups", gid)
  end
end
"#;

// argv: ns, groupId, payload, maxAttempts, orderMs, enqueuedAt, idSuffix
const ENQUEUE: &str = r#"
local ns = ARGV[1]
local groupId = ARGV[2]
local orderMs = tonumber(ARGV[5])
local readyKey = ns .. ":ready"
local gZ = ns .. ":g:" .. groupId

local seq = redis.call("INCR", ns .. ":seq")
local jobId = string.format("%016d", seq) .. "-" .. ARGV[7]

redis.call("HSET", ns .. ":job:" .. jobId,
  "id", jobId,
  "groupId", groupId,
  "payload", ARGV[3],
  "attempts", "0",
  "maxAttempts", ARGV[4],
  "seq", tostring(seq),
  "enqueuedAt", ARGV[6],
  "orderMs", ARGV[5]
)
redis.call("ZADD", gZ, orderMs, jobId)
redis.call("SADD", ns .. ":groups", groupId)

if redis.call("ZCARD", gZ) == 1 then
  redis.call("ZADD", readyKey, orderMs, groupId)
elseif redis.call("ZSCORE", readyKey, groupId) then
  -- a backfill may have become the new head
  local head = redis.call("ZRANGE", gZ, 0, 0, "WITHSCORES")
  redis.call("ZADD", readyKey, head[2], groupId)
end
-- reserved or delayed groups stay out of the ready index

signal(ns)
return jobId
"#;

// argv: ns, now, visibilityTimeoutMs, token, scanLimit, orderingDelayMs
const RESERVE: &str = r#"
local ns = ARGV[1]
local now = tonumber(ARGV[2])
local vt = tonumber(ARGV[3])
local token = ARGV[4]
local scanLimit = tonumber(ARGV[5])
local orderingDelay = tonumber(ARGV[6])
local readyKey = ns .. ":ready"
local delayedKey = ns .. ":delayed"

local due = redis.call("ZRANGEBYSCORE", delayedKey, "-inf", now, "LIMIT", 0, 100)
for _, gid in ipairs(due) do
  redis.call("ZREM", delayedKey, gid)
  local head = redis.call("ZRANGE", ns .. ":g:" .. gid, 0, 0, "WITHSCORES")
  if #head >= 2 then
    redis.call("ZADD", readyKey, head[2], gid)
  end
end

for _ = 1, scanLimit do
  local popped = redis.call("ZPOPMIN", readyKey, 1)
  if #popped == 0 then
    return false
  end
  local gid = popped[1]
  local gZ = ns .. ":g:" .. gid
  local head = redis.call("ZRANGE", gZ, 0, 0)

  if #head == 0 then
    redis.call("SREM", ns .. ":groups", gid)
  else
    local jobId = head[1]
    local jobKey = ns .. ":job:" .. jobId
    local leaseKey = ns .. ":lease:" .. jobId
    local leaseExp = tonumber(redis.call("HGET", leaseKey, "expiresAt"))

    if leaseExp and leaseExp > now then
      -- still held; completing that lease re-inserts the group
    elseif redis.call("EXISTS", jobKey) == 0 then
      redis.call("ZREM", gZ, jobId)
      local nextHead = redis.call("ZRANGE", gZ, 0, 0, "WITHSCORES")
      if #nextHead >= 2 then
        redis.call("ZADD", readyKey, nextHead[2], gid)
      else
        redis.call("SREM", ns .. ":groups", gid)
      end
    else
      local eligibleAt = now
      if orderingDelay > 0 then
        local orderMs = tonumber(redis.call("HGET", jobKey, "orderMs"))
        if orderMs then
          if orderMs > now then
            eligibleAt = orderMs
          else
            eligibleAt = math.min(orderMs + orderingDelay, MAX_MS)
          end
        end
      end

      if eligibleAt > now then
        redis.call("ZADD", delayedKey, eligibleAt, gid)
      else
        local deadline = math.min(now + vt, MAX_MS)
        redis.call("HSET", leaseKey, "token", token, "groupId", gid, "expiresAt", deadline)
        redis.call("ZADD", ns .. ":processing", deadline, jobId)
        return {jobId, gid, deadline, redis.call("HGETALL", jobKey)}
      end
    end
  end
end

return false
"#;

// argv: ns, jobId, token
const COMPLETE: &str = r#"
local ns = ARGV[1]
local jobId = ARGV[2]
local leaseKey = ns .. ":lease:" .. jobId
local jobKey = ns .. ":job:" .. jobId

if redis.call("HGET", leaseKey, "token") ~= ARGV[3] then
  return 0
end

local gid = redis.call("HGET", leaseKey, "groupId") or redis.call("HGET", jobKey, "groupId")
redis.call("DEL", leaseKey)
redis.call("ZREM", ns .. ":processing", jobId)
redis.call("DEL", jobKey)
if gid then
  redis.call("ZREM", ns .. ":g:" .. gid, jobId)
  advance(ns, gid)
end
return 1
"#;

// argv: ns, jobId, token, backoffMs, maxAttempts, now
// returns {status, attempts}: 0 stale lease, 1 re-queued, 2 abandoned
const RETRY: &str = r#"
local ns = ARGV[1]
local jobId = ARGV[2]
local backoffMs = tonumber(ARGV[4]) or 0
local maxAttempts = tonumber(ARGV[5])
local now = tonumber(ARGV[6])
local leaseKey = ns .. ":lease:" .. jobId
local jobKey = ns .. ":job:" .. jobId

if redis.call("HGET", leaseKey, "token") ~= ARGV[3] then
  return {0, 0}
end

local gid = redis.call("HGET", leaseKey, "groupId") or redis.call("HGET", jobKey, "groupId")
redis.call("DEL", leaseKey)
redis.call("ZREM", ns .. ":processing", jobId)
if not gid then
  redis.call("DEL", jobKey)
  return {0, 0}
end
local gZ = ns .. ":g:" .. gid

if redis.call("EXISTS", jobKey) == 0 then
  redis.call("ZREM", gZ, jobId)
  advance(ns, gid)
  return {0, 0}
end

local attempts = (tonumber(redis.call("HGET", jobKey, "attempts")) or 0) + 1
if attempts >= maxAttempts then
  redis.call("DEL", jobKey)
  redis.call("ZREM", gZ, jobId)
  advance(ns, gid)
  return {2, attempts}
end

redis.call("HSET", jobKey, "attempts", tostring(attempts))
if backoffMs > 0 then
  redis.call("ZADD", ns .. ":delayed", math.min(now + backoffMs, MAX_MS), gid)
else
  advance(ns, gid)
end
return {1, attempts}
"#;

// argv: ns, jobId, token, expiresAt
const HEARTBEAT: &str = r#"
local ns = ARGV[1]
local jobId = ARGV[2]
local leaseKey = ns .. ":lease:" .. jobId

if redis.call("HGET", leaseKey, "token") ~= ARGV[3] then
  return 0
end
redis.call("HSET", leaseKey, "expiresAt", ARGV[4])
redis.call("ZADD", ns .. ":processing", tonumber(ARGV[4]), jobId)
return 1
"#;

// argv: ns, now, limit
const RECLAIM: &str = r#"
local ns = ARGV[1]
local processingKey = ns .. ":processing"
local limit = tonumber(ARGV[3])
local reclaimed = 0

local expired = redis.call("ZRANGEBYSCORE", processingKey, "-inf", "(" .. ARGV[2], "LIMIT", 0, limit)
for _, jobId in ipairs(expired) do
  local leaseKey = ns .. ":lease:" .. jobId
  local jobKey = ns .. ":job:" .. jobId
  local gid = redis.call("HGET", leaseKey, "groupId") or redis.call("HGET", jobKey, "groupId")
  redis.call("DEL", leaseKey)
  redis.call("ZREM", processingKey, jobId)
  if gid then
    if redis.call("EXISTS", jobKey) == 0 then
      redis.call("ZREM", ns .. ":g:" .. gid, jobId)
    end
    redis.call("ZREM", ns .. ":delayed", gid)
    advance(ns, gid)
  end
  reclaimed = reclaimed + 1
end
return reclaimed
"#;

// argv: ns
// returns {active, waiting, delayed, groups}
const COUNTS: &str = r#"
local ns = ARGV[1]
local active = redis.call("ZCARD", ns .. ":processing")
local waiting = 0
local delayed = 0
local groups = 0

for _, gid in ipairs(redis.call("SMEMBERS", ns .. ":groups")) do
  local n = redis.call("ZCARD", ns .. ":g:" .. gid)
  if n > 0 then
    groups = groups + 1
    if redis.call("ZSCORE", ns .. ":delayed", gid) then
      delayed = delayed + n
    else
      waiting = waiting + n
    end
  end
end

-- leased jobs stay in their group until acked
waiting = waiting - active
if waiting < 0 then
  waiting = 0
end
return {active, waiting, delayed, groups}
"#;

// argv: ns
// returns {active ids, waiting ids, delayed ids}
const JOBS: &str = r#"
local ns = ARGV[1]
local active = redis.call("ZRANGE", ns .. ":processing", 0, -1)
local waiting = {}
local delayed = {}

for _, gid in ipairs(redis.call("SMEMBERS", ns .. ":groups")) do
  local isDelayed = redis.call("ZSCORE", ns .. ":delayed", gid)
  for _, jobId in ipairs(redis.call("ZRANGE", ns .. ":g:" .. gid, 0, -1)) do
    if isDelayed then
      table.insert(delayed, jobId)
    elseif redis.call("EXISTS", ns .. ":lease:" .. jobId) == 0 then
      table.insert(waiting, jobId)
    end
  end
end
return {active, waiting, delayed}
"#;

/// Compiled scripts, loaded lazily by `EVALSHA` on first use.
pub struct Scripts {
    pub enqueue: Script,
    pub reserve: Script,
    pub complete: Script,
    pub retry: Script,
    pub heartbeat: Script,
    pub reclaim: Script,
    pub counts: Script,
    pub jobs: Script,
}

impl Scripts {
    pub fn new() -> Self {
        let prelude = PRELUDE
            .replace("__SIGNAL_CAP__", &SIGNAL_CAP.to_string())
            .replace("__MAX_MS__", &MAX_SCORE_MS.to_string());
        let build = |body: &str| Script::new(&format!("{prelude}\n{body}"));
        Self {
            enqueue: build(ENQUEUE),
            reserve: build(RESERVE),
            complete: build(COMPLETE),
            retry: build(RETRY),
            heartbeat: build(HEARTBEAT),
            reclaim: build(RECLAIM),
            counts: build(COUNTS),
            jobs: build(JOBS),
        }
    }
}

impl Default for Scripts {
    fn default() -> Self {
        Self::new()
    }
}
