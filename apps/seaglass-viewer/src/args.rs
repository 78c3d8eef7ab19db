//! Command line options.

use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewerArgs {
    pub frames: u64,
    pub width: u32,
    pub height: u32,
    pub validation: bool,
    /// `None` disables the on-disk pipeline cache.
    pub pipeline_cache: Option<PathBuf>,
    pub help: bool,
}

impl Default for ViewerArgs {
    fn default() -> Self {
        Self {
            frames: 300,
            width: 1280,
            height: 720,
            validation: cfg!(debug_assertions),
            pipeline_cache: Some(PathBuf::from(seaglass_gpu::DEFAULT_PIPELINE_CACHE_PATH)),
            help: false,
        }
    }
}

impl ViewerArgs {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::parse(std::env::args().skip(1))
    }

    pub fn parse(args: impl IntoIterator<Item = String>) -> anyhow::Result<Self> {
        let mut parsed = Self::default();
        let mut args = args.into_iter();
        while let Some(arg) = args.next() {
            let mut value = |flag: &str| {
                args.next()
                    .ok_or_else(|| anyhow::anyhow!("{flag} expects a value"))
            };
            match arg.as_str() {
                "-f" | "--frames" => parsed.frames = number(&arg, &value(&arg)?)?,
                "--width" => parsed.width = number(&arg, &value(&arg)?)?,
                "--height" => parsed.height = number(&arg, &value(&arg)?)?,
                "--no-validation" => parsed.validation = false,
                "--validation" => parsed.validation = true,
                "--pipeline-cache" => parsed.pipeline_cache = Some(PathBuf::from(value(&arg)?)),
                "--no-pipeline-cache" => parsed.pipeline_cache = None,
                "-h" | "--help" => parsed.help = true,
                other => anyhow::bail!("unknown option '{other}' (see --help)"),
            }
        }
        if parsed.width == 0 || parsed.height == 0 {
            anyhow::bail!("output size must be nonzero");
        }
        Ok(parsed)
    }
}

fn number<T: std::str::FromStr>(flag: &str, value: &str) -> anyhow::Result<T> {
    value
        .parse()
        .map_err(|_| anyhow::anyhow!("{flag}: '{value}' is not a valid number"))
}

pub fn print_help() {
    eprintln!(
        "Seaglass headless viewer

Runs the standard pass graph for a fixed number of frames without a window.

USAGE:
    cargo run -p seaglass-viewer -- [OPTIONS]

OPTIONS:
    -f, --frames <N>          Frames to render (default: 300)
    --width <PX>              Output width (default: 1280)
    --height <PX>             Output height (default: 720)
    --validation              Enable Vulkan validation layers (default in debug builds)
    --no-validation           Disable Vulkan validation layers
    --pipeline-cache <PATH>   Pipeline cache file (default: {})
    --no-pipeline-cache       Do not load or save a pipeline cache
    -h, --help                Print this help message

ENVIRONMENT VARIABLES:
    RUST_LOG                  Set log level (e.g., info, debug, trace)",
        seaglass_gpu::DEFAULT_PIPELINE_CACHE_PATH
    );
}
