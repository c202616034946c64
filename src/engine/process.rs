// src/engine/process.rs
//
// Decoder backend that delegates to an external converter process.
//
// The converter is described by a program and an argument template. Each
// read renders the template, runs the program, drains stdout and stderr on
// copier threads and decodes whatever image the program wrote to stdout.

use crate::engine::decoder::{DecodedRaster, DecoderBackend, SourceFormat};
use crate::engine::raster::Raster;
use crate::engine::region::{extract_region, subsample, DecodeRegion};
use crate::error::LazyRegionError;
use image::GenericImageView;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::Instant;
use tracing::debug;

type ProcessResult<T> = std::result::Result<T, LazyRegionError>;

/// Program plus argument template.
///
/// Arguments may contain placeholders, replaced on every invocation:
/// `{input}`, `{reduce}` (level index), and the region in level
/// coordinates as `{x}`, `{y}`, `{width}`, `{height}`, `{x2}`, `{y2}`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl ProcessCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    fn render(&self, vars: &[(&str, String)]) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| {
                vars.iter().fold(arg.clone(), |acc, (key, value)| {
                    acc.replace(&format!("{{{key}}}"), value)
                })
            })
            .collect()
    }
}

/// Captured result of one converter run.
struct ProcessOutput {
    stdout: Vec<u8>,
    stderr: String,
}

fn run(program: &str, args: &[String]) -> ProcessResult<ProcessOutput> {
    let started = Instant::now();
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| {
            LazyRegionError::backend_process_failed(
                program.to_string(),
                -1,
                format!("failed to start: {e}"),
            )
        })?;

    // Both pipes are drained concurrently so a chatty stderr cannot block
    // the child while we wait on stdout.
    let stdout_copier = child.stdout.take().map(|mut pipe| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            pipe.read_to_end(&mut buf).map(|_| buf)
        })
    });
    let stderr_copier = child.stderr.take().map(|mut pipe| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            pipe.read_to_end(&mut buf).map(|_| buf)
        })
    });

    let status = child.wait().map_err(|e| {
        LazyRegionError::backend_process_failed(program.to_string(), -1, format!("wait failed: {e}"))
    })?;

    let collect = |copier: Option<thread::JoinHandle<std::io::Result<Vec<u8>>>>| {
        match copier.map(|handle| handle.join()) {
            Some(Ok(Ok(buf))) => Ok(buf),
            Some(Ok(Err(e))) => Err(LazyRegionError::backend_process_failed(
                program.to_string(),
                -1,
                format!("failed to read output: {e}"),
            )),
            Some(Err(_)) => Err(LazyRegionError::internal_panic("process output copier panicked")),
            None => Ok(Vec::new()),
        }
    };
    let stdout = collect(stdout_copier)?;
    let stderr = String::from_utf8_lossy(&collect(stderr_copier)?).trim().to_string();

    debug!(
        target: "lazy_region::process",
        program,
        status = status.code().unwrap_or(-1),
        stdout_bytes = stdout.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "backend process finished"
    );

    if !status.success() {
        return Err(LazyRegionError::backend_process_failed(
            program.to_string(),
            status.code().unwrap_or(-1),
            stderr,
        ));
    }
    Ok(ProcessOutput { stdout, stderr })
}

/// Backend driving an external converter over a source file.
///
/// Such sources have no cheap level count; it is learned
/// from an optional scan command whose stdout is the count.
pub struct ProcessBackend {
    input: PathBuf,
    format: SourceFormat,
    full: (u32, u32),
    command: ProcessCommand,
    level_scan: Option<ProcessCommand>,
    level_count: Option<u32>,
}

impl ProcessBackend {
    pub fn new(
        input: impl Into<PathBuf>,
        format: SourceFormat,
        full: (u32, u32),
        command: ProcessCommand,
    ) -> Self {
        Self {
            input: input.into(),
            format,
            full,
            command,
            level_scan: None,
            level_count: None,
        }
    }

    pub fn with_level_scan(mut self, scan: ProcessCommand) -> Self {
        self.level_scan = Some(scan);
        self
    }

    pub fn input(&self) -> &Path {
        &self.input
    }

    fn input_var(&self) -> (&'static str, String) {
        ("input", self.input.to_string_lossy().into_owned())
    }
}

impl DecoderBackend for ProcessBackend {
    fn source_format(&self) -> SourceFormat {
        self.format
    }

    fn quick_level_count(&mut self) -> Option<u32> {
        self.level_count
    }

    fn scan_level_count(&mut self) -> ProcessResult<u32> {
        if let Some(count) = self.level_count {
            return Ok(count);
        }
        let count = match &self.level_scan {
            None => 1,
            Some(scan) => {
                let args = scan.render(&[self.input_var()]);
                let output = run(&scan.program, &args)?;
                let text = String::from_utf8_lossy(&output.stdout);
                text.trim().parse::<u32>().map_err(|_| {
                    LazyRegionError::backend_process_failed(
                        scan.program.clone(),
                        0,
                        format!("level scan printed {:?}; {}", text.trim(), output.stderr),
                    )
                })?
            }
        };
        let count = count.max(1);
        self.level_count = Some(count);
        Ok(count)
    }

    fn level_size(&mut self, level: usize) -> ProcessResult<(u32, u32)> {
        let count = self.num_levels()? as usize;
        if level >= count {
            return Err(LazyRegionError::invalid_argument(
                "level",
                level.to_string(),
                format!("source has {count} level(s)"),
            ));
        }
        let divisor = 1u32 << level.min(31);
        Ok((self.full.0.div_ceil(divisor), self.full.1.div_ceil(divisor)))
    }

    fn read_region(&mut self, level: usize, region: &DecodeRegion) -> ProcessResult<DecodedRaster> {
        let (level_w, level_h) = self.level_size(level)?;
        let vars = [
            self.input_var(),
            ("reduce", level.to_string()),
            ("x", region.x.to_string()),
            ("y", region.y.to_string()),
            ("width", region.width.to_string()),
            ("height", region.height.to_string()),
            ("x2", (region.x + region.width).to_string()),
            ("y2", (region.y + region.height).to_string()),
        ];
        let args = self.command.render(&vars);
        let output = run(&self.command.program, &args)?;

        let image = image::load_from_memory(&output.stdout).map_err(|e| {
            LazyRegionError::decode_failed(
                level as u32,
                region.to_string(),
                format!("{} output: {e}", self.command.program),
            )
        })?;

        // Converters that ignore the region hand back the whole level.
        let image = if image.dimensions() == (region.width, region.height) {
            subsample(image, region.subsample)
        } else if image.dimensions() == (level_w, level_h) {
            extract_region(&image, region)
        } else {
            return Err(LazyRegionError::decode_failed(
                level as u32,
                region.to_string(),
                format!(
                    "{} returned {}x{}",
                    self.command.program,
                    image.width(),
                    image.height()
                ),
            ));
        };
        Ok(DecodedRaster::new(Raster::new(image)))
    }
}
