use clap::Parser;

use crate::error::ReplayError;
use crate::rebalance::RebalancePolicy;

/// Replays a captured collective-communication trace against a backend and
/// reports latency and size statistics.
#[derive(Parser, Debug, Clone)]
#[command(name = "comms_replay")]
pub struct Opts {
    /// Location of the trace: a local path or a `<scheme>://` URL. Each rank
    /// reads `<trace-path>/rank<R>.json` unless `--use-one-trace` is set.
    #[clap(long, default_value = "./")]
    pub trace_path: String,

    /// All ranks read the same trace file.
    #[clap(long)]
    pub use_one_trace: bool,

    /// Analyze the trace without replaying; rank 0 prints statistics only.
    #[clap(long)]
    pub dry_run: bool,

    /// Rescale message sizes and rebind to the default group when the
    /// recorded world is larger than the live one.
    #[clap(long)]
    pub auto_shrink: bool,

    /// Replay only the first N operations (0 means no limit).
    #[clap(long, default_value_t = 0)]
    pub max_msg_cnt: usize,

    /// Run an unmeasured warm-up pass before the measured replay.
    #[clap(long)]
    pub do_warm_up: bool,

    /// Comma-separated collective kinds to replay; `all` accepts every kind
    /// the backend supports. Typos and unsupported kinds are ignored.
    #[clap(long, default_value = "all")]
    pub allow_ops: String,

    /// Directory (or URL) receiving the augmented per-rank traces; an empty
    /// value disables output.
    #[clap(long, default_value = "")]
    pub output_path: String,

    /// Number of consecutive collectives per batch; a positive value enables
    /// per-batch latency stats (a batch closes on its final `wait`).
    #[clap(long, default_value_t = 0)]
    pub colls_per_batch: u32,

    /// Pace dispatches to the captured `startTime_ns` timestamps.
    #[clap(long)]
    pub use_timestamp: bool,

    /// Balancing policy for all_to_allv splits, applied during warm-up.
    /// Supported: `equal`. Unsupported values are ignored.
    #[clap(long, default_value = "")]
    pub rebalance_policy: String,

    /// Number of times to replay the measured pass.
    #[clap(long, default_value_t = 1)]
    pub num_replays: u32,

    /// Blocking replay semantics; pass `--blocking false` to post
    /// collectives asynchronously and join them on `wait` ops.
    #[clap(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub blocking: bool,

    /// Validate output buffers element-wise after each blocking collective.
    #[clap(long)]
    pub data_check: bool,

    /// Communication backend to replay against.
    #[clap(long, default_value = "loopback")]
    pub backend: String,
}

/// World membership, taken from the launcher environment.
#[derive(Debug, Clone)]
pub struct WorldInfo {
    pub world_size: u32,
    pub global_rank: u32,
    pub local_rank: u32,
    pub master_addr: String,
    pub master_port: u16,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T, ReplayError> {
    match std::env::var(key) {
        Ok(value) => value.parse().map_err(|_| {
            ReplayError::InvalidConfiguration(format!("{key}={value} is not a valid value"))
        }),
        Err(_) => Ok(default),
    }
}

impl WorldInfo {
    pub fn from_env() -> Result<WorldInfo, ReplayError> {
        let global_rank = env_parse("RANK", 0)?;
        Ok(WorldInfo {
            world_size: env_parse("WORLD_SIZE", 1)?,
            global_rank,
            local_rank: env_parse("LOCAL_RANK", global_rank)?,
            master_addr: std::env::var("MASTER_ADDR").unwrap_or_else(|_| "127.0.0.1".to_owned()),
            master_port: env_parse("MASTER_PORT", 29500)?,
        })
    }
}

/// Static replay parameters resolved from the CLI flags.
#[derive(Debug, Clone)]
pub struct ReplayConfig {
    pub blocking: bool,
    pub auto_shrink: bool,
    pub max_msg_cnt: usize,
    pub do_warm_up: bool,
    pub allow_ops: String,
    pub out_path: String,
    pub colls_per_batch: u32,
    pub use_timestamp: bool,
    pub rebalance_policy: Option<RebalancePolicy>,
    pub num_replays: u32,
    pub data_check: bool,
}

impl ReplayConfig {
    pub fn from_opts(opts: &Opts) -> ReplayConfig {
        ReplayConfig {
            blocking: opts.blocking,
            auto_shrink: opts.auto_shrink,
            max_msg_cnt: opts.max_msg_cnt,
            do_warm_up: opts.do_warm_up,
            allow_ops: opts.allow_ops.clone(),
            out_path: opts.output_path.clone(),
            colls_per_batch: opts.colls_per_batch,
            use_timestamp: opts.use_timestamp,
            rebalance_policy: RebalancePolicy::from_flag(&opts.rebalance_policy),
            num_replays: opts.num_replays.max(1),
            data_check: opts.data_check,
        }
    }

    /// Bounds the replayed prefix: `max_msg_cnt == 0` means the whole trace.
    pub fn max_ops(&self, trace_len: usize) -> usize {
        if self.max_msg_cnt == 0 {
            trace_len
        } else {
            self.max_msg_cnt.min(trace_len)
        }
    }
}

/// The trace file this rank reads: shared, or one file per rank.
pub fn trace_location(opts: &Opts, global_rank: u32) -> String {
    if opts.use_one_trace {
        opts.trace_path.clone()
    } else {
        format!("{}/rank{}.json", opts.trace_path, global_rank)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn per_rank_trace_paths_are_derived() {
        let opts = Opts::parse_from(["comms_replay", "--trace-path", "/traces/run1"]);
        assert_eq!(trace_location(&opts, 3), "/traces/run1/rank3.json");

        let opts = Opts::parse_from([
            "comms_replay",
            "--trace-path",
            "/traces/one.json",
            "--use-one-trace",
        ]);
        assert_eq!(trace_location(&opts, 3), "/traces/one.json");
    }

    #[test]
    fn max_ops_honors_the_message_cap() {
        let opts = Opts::parse_from(["comms_replay", "--max-msg-cnt", "5"]);
        let cfg = ReplayConfig::from_opts(&opts);
        assert_eq!(cfg.max_ops(100), 5);
        assert_eq!(cfg.max_ops(3), 3);

        let unlimited = ReplayConfig::from_opts(&Opts::parse_from(["comms_replay"]));
        assert_eq!(unlimited.max_ops(100), 100);
    }

    #[test]
    fn blocking_defaults_on_and_takes_a_value() {
        let opts = Opts::parse_from(["comms_replay"]);
        assert!(opts.blocking);
        let opts = Opts::parse_from(["comms_replay", "--blocking", "false"]);
        assert!(!opts.blocking);
    }
}
