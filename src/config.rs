use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::LazyLock;

use clap::Parser;
use ffmpeg_mux::MuxerConfig;

/// Re-muxes camera video into fragmented MP4 and publishes it per channel.
#[derive(Parser, Debug, Clone)]
#[clap(name = "geomux", version)]
pub struct Config {
    /// Camera id used in endpoint names.
    #[clap(long, env = "GEOMUX_CAMERA", default_value_t = 0)]
    pub camera: u32,

    /// Channels to stream.
    #[clap(long, env = "GEOMUX_CHANNELS", value_delimiter = ',', default_value = "1")]
    pub channels: Vec<u32>,

    /// Annex B H.264 file the replay source plays back.
    #[clap(long, env = "GEOMUX_REPLAY_FILE")]
    pub replay_file: PathBuf,

    #[clap(long, env = "GEOMUX_FPS", default_value_t = 30)]
    pub fps: u32,

    /// Play the replay file once instead of looping it.
    #[clap(long, env = "GEOMUX_NO_LOOP")]
    pub no_loop: bool,

    /// Hardware buffers the replay source cycles through.
    #[clap(long, env = "GEOMUX_SOURCE_BUFFERS", default_value_t = 8)]
    pub source_buffers: u32,

    #[clap(long, env = "GEOMUX_SOCKET_DIR", default_value = "/tmp")]
    pub socket_dir: PathBuf,

    #[clap(long, env = "GEOMUX_LISTEN", default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,

    /// Bytes buffered before the input format is probed.
    #[clap(long, env = "GEOMUX_PROBE_SIZE", default_value_t = 300_000)]
    pub probe_size: usize,

    #[clap(long, env = "GEOMUX_BUFFER_CAPACITY", default_value_t = 5_000_000)]
    pub buffer_capacity: usize,

    #[clap(long, env = "GEOMUX_READ_BUFFER_SIZE", default_value_t = 4_000_000)]
    pub read_buffer_size: usize,

    #[clap(long, env = "GEOMUX_WRITE_BUFFER_SIZE", default_value_t = 4_000_000)]
    pub write_buffer_size: usize,

    /// Segments a slow subscriber may fall behind before it skips ahead.
    #[clap(long, env = "GEOMUX_SEGMENT_BACKLOG", default_value_t = 64)]
    pub segment_backlog: usize,

    /// Seconds between channel health checks.
    #[clap(long, env = "GEOMUX_SUPERVISE_INTERVAL", default_value_t = 5)]
    pub supervise_interval: u64,
}

impl Config {
    pub fn muxer_config(&self, name: &str) -> MuxerConfig {
        MuxerConfig {
            name: name.to_string(),
            probe_size: self.probe_size,
            buffer_capacity: self.buffer_capacity,
            read_buffer_size: self.read_buffer_size,
            write_buffer_size: self.write_buffer_size,
            ..Default::default()
        }
    }
}

pub fn config() -> &'static Config {
    static CONFIG: LazyLock<Config> = LazyLock::new(Config::parse);
    &CONFIG
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() -> anyhow::Result<()> {
        let config = Config::try_parse_from(["geomux", "--replay-file", "clip.h264"])?;
        assert_eq!(config.camera, 0);
        assert_eq!(config.channels, vec![1]);
        assert_eq!(config.fps, 30);
        assert!(!config.no_loop);
        assert_eq!(config.socket_dir, PathBuf::from("/tmp"));
        assert_eq!(config.listen.port(), 8080);

        let muxer = config.muxer_config("video0_1");
        let defaults = MuxerConfig::default();
        assert_eq!(muxer.name, "video0_1");
        assert_eq!(muxer.probe_size, defaults.probe_size);
        assert_eq!(muxer.buffer_capacity, defaults.buffer_capacity);
        assert_eq!(muxer.movflags, defaults.movflags);
        Ok(())
    }

    #[test]
    fn test_channel_list() -> anyhow::Result<()> {
        let config = Config::try_parse_from([
            "geomux",
            "--replay-file",
            "clip.h264",
            "--channels",
            "1,2,3",
            "--probe-size",
            "4096",
        ])?;
        assert_eq!(config.channels, vec![1, 2, 3]);
        assert_eq!(config.muxer_config("x").probe_size, 4096);
        Ok(())
    }

    #[test]
    fn test_replay_file_required() {
        assert!(Config::try_parse_from(["geomux"]).is_err());
    }
}
