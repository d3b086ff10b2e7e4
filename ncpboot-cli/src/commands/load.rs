//! Image load (the default command).

use anyhow::{Context, Result};
use console::style;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use log::{debug, info};
use ncpboot::bootload::{BootloadOptions, MenuLink, PassiveLink, PercentageReporter, bootload_image};
use ncpboot::port::{DEFAULT_BAUD_RATE, FlowControl, NativePort, Port, SerialConfig};
use ncpboot::{TransferProtocol, XmodemConfig, auto_detect_port};
use std::path::PathBuf;

use crate::config::Config;
use crate::{Cli, CliError, use_fancy_output, was_interrupted};

/// Everything needed for one load, after merging CLI, env and config files.
#[derive(Debug, Clone)]
pub(crate) struct LoadRequest {
    pub image: PathBuf,
    pub offset: u32,
    pub length: u32,
    /// `None` means auto-detect.
    pub port: Option<String>,
    pub baud: u32,
    pub flow_control: FlowControl,
    pub menu: bool,
    pub options: BootloadOptions,
}

impl LoadRequest {
    /// Merge command-line values over config file values.
    pub fn resolve(cli: &Cli, config: &Config) -> Result<Self> {
        let (Some(image), Some(offset), Some(length)) = (cli.image.clone(), cli.offset, cli.length)
        else {
            return Err(CliError::Usage("IMAGE, OFFSET and LENGTH are required".to_string()).into());
        };

        let mut xmodem = XmodemConfig::default();
        if let Some(retries) = cli
            .retries
            .or(config.bootload.retries)
        {
            if retries == 0 {
                return Err(CliError::Usage("--retries must be at least 1".to_string()).into());
            }
            xmodem.max_retries = retries;
        }

        let protocol = cli
            .protocol
            .map(TransferProtocol::from)
            .or(config.bootload.protocol)
            .unwrap_or_default();

        Ok(Self {
            image,
            offset,
            length,
            port: cli
                .port
                .clone()
                .or_else(|| config.connection.serial.clone()),
            baud: cli
                .baud
                .or(config.connection.baud)
                .unwrap_or(DEFAULT_BAUD_RATE),
            flow_control: cli
                .flow_control
                .or(config.connection.flow_control)
                .map(FlowControl::from)
                .unwrap_or_default(),
            menu: cli.menu || config.bootload.menu,
            options: BootloadOptions {
                protocol,
                start_immediately: cli.start_immediately || config.bootload.start_immediately,
                xmodem,
            },
        })
    }
}

fn progress_bar(quiet: bool) -> ProgressBar {
    if quiet || !use_fancy_output() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(0);
    let style = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}")
        .map_or_else(|_| ProgressStyle::default_bar(), |s| s.progress_chars("#>-"));
    pb.set_style(style);
    pb.set_draw_target(ProgressDrawTarget::stderr());
    pb
}

/// Load command implementation.
pub(crate) fn cmd_load(request: &LoadRequest, quiet: bool) -> Result<()> {
    if !request
        .image
        .is_file()
    {
        return Err(CliError::Usage(format!(
            "Image file not found: {}",
            request.image.display()
        ))
        .into());
    }

    let port_name = match &request.port {
        Some(port) => port.clone(),
        None => {
            auto_detect_port()
                .context("No serial port specified (use -p/--port or NCPBOOT_PORT)")?
                .name
        },
    };
    if was_interrupted() {
        return Err(CliError::Cancelled("Interrupted".to_string()).into());
    }

    if !quiet {
        eprintln!(
            "{} Using {} at {} baud ({})",
            style("→").cyan(),
            style(&port_name).green(),
            request.baud,
            request.options.protocol
        );
    }

    let serial_config =
        SerialConfig::new(&port_name, request.baud).with_flow_control(request.flow_control);
    let mut port =
        NativePort::open(&serial_config).with_context(|| format!("Failed to open {port_name}"))?;
    // Drop boot banners and menu text left over from before the open.
    port.clear_buffers()?;
    debug!("Opened {}", port.name());

    let pb = progress_bar(quiet);
    let log_percentages = pb.is_hidden() && !quiet;
    let mut reporter = PercentageReporter::default();
    let mut progress = |sent: u64, total: u64| {
        pb.set_length(total);
        pb.set_position(sent);
        if log_percentages {
            if let Some(percent) = reporter.update(sent, total) {
                info!("{percent}% ({sent}/{total} bytes)");
            }
        }
    };

    let result = if request.menu {
        bootload_image(
            &mut MenuLink::default(),
            &mut port,
            &request.image,
            request.offset,
            request.length,
            &request.options,
            &mut progress,
        )
    } else {
        bootload_image(
            &mut PassiveLink,
            &mut port,
            &request.image,
            request.offset,
            request.length,
            &request.options,
            &mut progress,
        )
    };

    match result {
        Ok(()) => {
            pb.finish_and_clear();
            println!("Image loaded.");
            Ok(())
        },
        Err(e) => {
            pb.abandon();
            println!("Image failed to load.");
            Err(anyhow::Error::from(e).context("Bootload failed"))
        },
    }
}
