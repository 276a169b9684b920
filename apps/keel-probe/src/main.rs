//! Headless end-to-end check of the keel GPU layer.
//!
//! Creates a headless context, allocates a host-visible buffer, fills one
//! slice of it per worker thread from parallel-recorded command buffers,
//! submits them once and reads the result back.
//!
//! ## Usage
//!
//! ```bash
//! cargo run -p keel-probe -- [OPTIONS]
//! ```
//!
//! ## Options
//!
//! - `--threads <N>`: Recording worker threads, one task each (default: 4)
//! - `--words <N>`: Buffer size in 32-bit words (default: 65536)
//! - `--validation`: Enable validation layers
//! - `-h, --help`: Print help message
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Set log level (e.g., info, debug, trace)

use anyhow::{bail, Context};
use ash::vk;
use keel_gpu::barrier::build_buffer_barriers;
use keel_gpu::{
    BufferDesc, BufferTransition, CommandDevice, Device, Fence, GpuContextBuilder, RecordingTask,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_THREADS: usize = 4;
const DEFAULT_WORDS: usize = 65536;
const FILL_BASE: u32 = 0x1000;

struct Options {
    threads: usize,
    words: usize,
    validation: bool,
}

fn parse_args() -> anyhow::Result<Option<Options>> {
    let mut options = Options {
        threads: DEFAULT_THREADS,
        words: DEFAULT_WORDS,
        validation: false,
    };

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-h" | "--help" => return Ok(None),
            "--threads" => {
                options.threads = args
                    .next()
                    .context("--threads needs a value")?
                    .parse()
                    .context("invalid --threads")?;
            }
            "--words" => {
                options.words = args
                    .next()
                    .context("--words needs a value")?
                    .parse()
                    .context("invalid --words")?;
            }
            "--validation" => options.validation = true,
            other => bail!("unknown argument: {other}"),
        }
    }

    if options.threads == 0 {
        bail!("--threads must be at least 1");
    }
    if options.words < options.threads {
        bail!("--words must be at least --threads");
    }
    Ok(Some(options))
}

/// Word range `[start, end)` filled by `task`; the last task takes the rest.
fn task_range(task: usize, tasks: usize, words: usize) -> (usize, usize) {
    let chunk = words / tasks;
    let start = task * chunk;
    let end = if task + 1 == tasks { words } else { start + chunk };
    (start, end)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let Some(options) = parse_args()? else {
        print_help();
        return Ok(());
    };

    let ctx = GpuContextBuilder::new()
        .app_name("keel-probe")
        .headless(true)
        .validation(options.validation)
        .worker_threads(options.threads)
        .build()?;
    info!("Using {}", ctx.physical_device().summary());

    let size = (options.words * std::mem::size_of::<u32>()) as vk::DeviceSize;
    let mut resources = ctx.resources().lock();
    let buffer_id = resources.create_buffer(&BufferDesc::host_visible(
        size,
        vk::BufferUsageFlags::TRANSFER_DST,
    ))?;
    let buffer = resources.buffer(buffer_id)?.handle();

    let recorder = ctx.recorder();
    let pools = recorder.create_worker_pools(ctx.device(), ctx.queue_family(), false)?;
    let mut command_buffers = Vec::with_capacity(pools.len());
    for pool in &pools {
        command_buffers.extend(pool.allocate(1)?);
    }

    let task_count = command_buffers.len();
    let tasks: Vec<RecordingTask<'_, Device>> = command_buffers
        .iter_mut()
        .enumerate()
        .map(|(i, command_buffer)| {
            let (start, end) = task_range(i, task_count, options.words);
            let offset = (start * std::mem::size_of::<u32>()) as vk::DeviceSize;
            let len = ((end - start) * std::mem::size_of::<u32>()) as vk::DeviceSize;

            RecordingTask::new(command_buffer, move |device: &Device, cmd| {
                let mut transition = BufferTransition::whole(
                    buffer,
                    vk::AccessFlags::TRANSFER_WRITE,
                    vk::AccessFlags::HOST_READ,
                );
                transition.offset = offset;
                transition.size = len;
                let barriers = build_buffer_barriers(&[transition]);

                // SAFETY: `cmd` is recording and the range lies inside `buffer`.
                unsafe {
                    device
                        .raw()
                        .cmd_fill_buffer(cmd, buffer, offset, len, FILL_BASE + i as u32);
                    device.cmd_pipeline_barrier(
                        cmd,
                        vk::PipelineStageFlags::TRANSFER,
                        vk::PipelineStageFlags::HOST,
                        vk::DependencyFlags::empty(),
                        &[],
                        &barriers,
                        &[],
                    );
                }
                Ok(())
            })
        })
        .collect();

    let fence = Fence::new(ctx.device().clone(), false)?;
    // SAFETY: every buffer comes from its own pool of this device.
    unsafe {
        recorder.record_on_multiple_threads(
            &**ctx.device(),
            ctx.queue(),
            tasks,
            &[],
            &[],
            fence.handle(),
        )?;
    }
    fence.wait(ctx.fence_timeout_ns())?;
    for command_buffer in &mut command_buffers {
        // SAFETY: the fence covering every buffer has signaled.
        unsafe { command_buffer.mark_completed(&**ctx.device())? };
    }
    info!("{task_count} tasks recorded and executed");

    let words: Vec<u32> = resources.read_buffer(buffer_id, 0, options.words)?;
    for task in 0..task_count {
        let (start, end) = task_range(task, task_count, options.words);
        let expected = FILL_BASE + task as u32;
        if let Some(pos) = words[start..end].iter().position(|&w| w != expected) {
            bail!(
                "word {} is {:#x}, expected {expected:#x}",
                start + pos,
                words[start + pos]
            );
        }
    }
    info!("Read back {} words, all slices match", words.len());

    resources.destroy(buffer_id)?;
    Ok(())
}

fn print_help() {
    eprintln!(
        "keel GPU layer probe

USAGE:
    cargo run -p keel-probe -- [OPTIONS]

OPTIONS:
    --threads <N>   Recording worker threads, one task each (default: {DEFAULT_THREADS})
    --words <N>     Buffer size in 32-bit words (default: {DEFAULT_WORDS})
    --validation    Enable validation layers
    -h, --help      Print this help message

ENVIRONMENT VARIABLES:
    RUST_LOG        Set log level (e.g., info, debug, trace)"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_ranges_cover_every_word_once() {
        let ranges: Vec<_> = (0..3).map(|t| task_range(t, 3, 10)).collect();
        assert_eq!(ranges, [(0, 3), (3, 6), (6, 10)]);
    }
}
