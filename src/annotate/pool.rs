//! 并行标注线程池 (Parallel annotation pool)
//!
//! - 任务通道: 帧序号, 所有 worker 共享
//! - 互斥锁只保护 (clip, markers) 的读取, 绘制在锁外的私有副本上进行
//! - 结果通道有界; 收集端用 BTreeMap 重排, 保证按原顺序写出
//! - 任一帧失败时收集端丢弃结果通道, 其余 worker 随即退出

use std::collections::BTreeMap;
use std::sync::Mutex;

use crossbeam_channel::{bounded, unbounded};
use image::{DynamicImage, RgbaImage};

use super::{Marker, Painter};
use crate::error::{Error, Result};
use crate::video::{Clip, FrameSink};

type Rendered = (usize, Result<RgbaImage>);

/// Render every clip frame on `workers` threads and write them to `sink` in
/// clip order.
pub fn render_parallel(
    clip: &Clip,
    markers: &[Vec<Marker>],
    painter: &Painter,
    workers: usize,
    sink: &mut dyn FrameSink,
) -> Result<()> {
    let total = clip.len();
    let workers = workers.clamp(1, total.max(1));
    let shared = Mutex::new((clip, markers));

    let (job_tx, job_rx) = unbounded::<usize>();
    for i in 0..total {
        // 接收端仍在作用域内, 发送不会失败
        let _ = job_tx.send(i);
    }
    drop(job_tx);

    let (result_tx, result_rx) = bounded::<Rendered>(workers * 2);
    tracing::debug!(workers, frames = total, "annotation pool started");

    std::thread::scope(|scope| {
        for _ in 0..workers {
            let job_rx = job_rx.clone();
            let result_tx = result_tx.clone();
            let shared = &shared;
            scope.spawn(move || {
                for index in job_rx.iter() {
                    let rendered = read_frame(shared, index)
                        .map(|(frame, number, markers)| painter.render(&frame, number, &markers));
                    if result_tx.send((index, rendered)).is_err() {
                        break;
                    }
                }
            });
        }
        drop(result_tx);

        let written = collect_in_order(&result_rx, total, sink);
        // 提前返回时让阻塞在 send 上的 worker 退出
        drop(result_rx);
        written
    })
}

fn read_frame(
    shared: &Mutex<(&Clip, &[Vec<Marker>])>,
    index: usize,
) -> Result<(DynamicImage, usize, Vec<Marker>)> {
    let guard = shared
        .lock()
        .map_err(|_| Error::state("annotation worker panicked"))?;
    let (clip, markers) = *guard;
    let frame = clip.frame(index)?;
    let frame_markers = markers.get(index).cloned().unwrap_or_default();
    Ok((frame, clip.frame_number(index), frame_markers))
}

fn collect_in_order(
    results: &crossbeam_channel::Receiver<Rendered>,
    total: usize,
    sink: &mut dyn FrameSink,
) -> Result<()> {
    let mut pending: BTreeMap<usize, RgbaImage> = BTreeMap::new();
    let mut next = 0;
    for (index, rendered) in results.iter() {
        pending.insert(index, rendered?);
        while let Some(image) = pending.remove(&next) {
            sink.write_frame(&image)?;
            next += 1;
        }
    }
    if next != total {
        return Err(Error::state(format!(
            "annotation pool stopped after {} of {} frames",
            next, total
        )));
    }
    Ok(())
}
