// pool.rs
//
// Copyright (c) 2024 Junpei Kawamoto
//
// This software is released under the MIT License.
//
// http://opensource.org/licenses/mit-license.php

//! Fixed size pool of inference workers.
//!
//! Workers pull jobs from one shared queue, so a slow unit only holds up the
//! worker that took it. Results travel back on a per-dispatch channel in
//! completion order and are matched to their unit by key.

use std::any::Any;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{anyhow, Context, Result};
use crossbeam::channel::{unbounded, Receiver, Sender};
use tracing::{debug, error, info, warn};

use crate::engine::{Engine, EngineFactory};
use crate::unit::{EncodedUnit, Failure, Report, Translation, UnitKey};

type Outcome = std::result::Result<Translation, Failure>;

struct Job {
    unit: EncodedUnit,
    reply: Sender<Outcome>,
}

pub struct WorkerPool {
    jobs: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `workers` threads. Engines are loaded lazily by each worker.
    pub fn start<F>(workers: usize, factory: F) -> Result<Self>
    where
        F: EngineFactory + 'static,
    {
        let factory: Arc<dyn EngineFactory> = Arc::new(factory);
        let (tx, rx) = unbounded::<Job>();

        let workers = (0..workers.max(1))
            .map(|id| {
                let rx = rx.clone();
                let factory = factory.clone();
                thread::Builder::new()
                    .name(format!("tagmt-worker-{id}"))
                    .spawn(move || worker_loop(id, rx, factory))
                    .with_context(|| format!("failed to spawn worker {id}"))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            jobs: Some(tx),
            workers,
        })
    }

    /// Like [`WorkerPool::start`], but fails up front when the factory cannot
    /// build an engine, so a missing model never turns into per-unit failures.
    pub fn start_checked<F>(workers: usize, factory: F) -> Result<Self>
    where
        F: EngineFactory + 'static,
    {
        factory.check().context("failed to load the model")?;
        Self::start(workers, factory)
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Translates `units` and waits until every one has an outcome.
    pub fn dispatch(&self, units: Vec<EncodedUnit>) -> Result<Report> {
        let jobs = self
            .jobs
            .as_ref()
            .ok_or_else(|| anyhow!("worker pool is shut down"))?;
        info!("processing {} tasks on {} workers", units.len(), self.size());

        let (reply, results) = unbounded();
        let mut pending: HashMap<UnitKey, usize> = HashMap::new();
        for unit in units {
            *pending.entry(unit.key).or_default() += 1;
            jobs.send(Job {
                unit,
                reply: reply.clone(),
            })
            .map_err(|_| anyhow!("worker pool is shut down"))?;
        }
        drop(reply);

        let mut report = Report::default();
        for outcome in results.iter() {
            let key = match &outcome {
                Ok(t) => t.key,
                Err(f) => f.key,
            };
            if let Some(n) = pending.get_mut(&key) {
                *n -= 1;
                if *n == 0 {
                    pending.remove(&key);
                }
            }

            match outcome {
                Ok(t) => {
                    info!("translated {}: {}", t.key, t.text);
                    report.translations.push(t);
                }
                Err(f) => {
                    warn!("failed to translate {}: {}", f.key, f.reason);
                    report.failures.push(f);
                }
            }
        }

        // Only reachable if the workers went away with jobs still queued.
        for (key, n) in pending {
            for _ in 0..n {
                report.failures.push(Failure {
                    key,
                    reason: "worker pool stopped before the unit was processed".to_string(),
                });
            }
        }

        report.sort();
        info!(
            "processed {} results, {} failed",
            report.translations.len(),
            report.failures.len()
        );
        Ok(report)
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.jobs.take();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                error!("a worker thread panicked");
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn load_engine(
    id: usize,
    factory: &dyn EngineFactory,
) -> std::result::Result<Box<dyn Engine>, String> {
    info!(worker = id, "loading model in worker");
    match catch_unwind(AssertUnwindSafe(|| factory.load())) {
        Ok(Ok(engine)) => Ok(engine),
        Ok(Err(e)) => {
            error!(worker = id, "failed to load model: {e:#}");
            Err(format!("failed to load model: {e:#}"))
        }
        Err(payload) => {
            let msg = panic_message(payload.as_ref());
            error!(worker = id, "model loading panicked: {msg}");
            Err(format!("model loading panicked: {msg}"))
        }
    }
}

fn process(
    id: usize,
    slot: &mut Option<Box<dyn Engine>>,
    factory: &dyn EngineFactory,
    unit: EncodedUnit,
) -> Outcome {
    let engine = match slot.take() {
        Some(engine) => engine,
        None => load_engine(id, factory).map_err(|reason| Failure {
            key: unit.key,
            reason,
        })?,
    };

    match catch_unwind(AssertUnwindSafe(|| engine.translate(&unit))) {
        Ok(result) => {
            *slot = Some(engine);
            result
                .map(|text| Translation {
                    key: unit.key,
                    text,
                })
                .map_err(|e| Failure {
                    key: unit.key,
                    reason: format!("{e:#}"),
                })
        }
        Err(payload) => {
            // The engine may be in a broken state; the next job reloads it.
            Err(Failure {
                key: unit.key,
                reason: format!("inference panicked: {}", panic_message(payload.as_ref())),
            })
        }
    }
}

fn worker_loop(id: usize, jobs: Receiver<Job>, factory: Arc<dyn EngineFactory>) {
    let mut engine = None;
    for job in jobs.iter() {
        debug!(worker = id, "processing {}", job.unit.key);
        let outcome = process(id, &mut engine, factory.as_ref(), job.unit);
        if job.reply.send(outcome).is_err() {
            debug!(worker = id, "dispatcher went away");
        }
    }
    debug!(worker = id, "worker exiting");
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;

    struct Echo;

    impl Engine for Echo {
        fn translate(&self, unit: &EncodedUnit) -> Result<String> {
            Ok(format!("{:?}", unit.input_ids))
        }
    }

    fn echo_factory() -> Result<Box<dyn Engine>> {
        Ok(Box::new(Echo))
    }

    #[test]
    fn results_are_keyed_and_sorted() {
        let pool = WorkerPool::start(3, echo_factory).unwrap();
        assert_eq!(pool.size(), 3);
        let units = (0..20u32)
            .rev()
            .map(|p| EncodedUnit::new(UnitKey::chapter(p % 2, p), vec![p as i64, 0]))
            .collect();

        let report = pool.dispatch(units).unwrap();
        assert!(report.failures.is_empty());
        assert_eq!(report.translations.len(), 20);
        assert_eq!(report.translations[0].key, UnitKey::chapter(0, 0));
        assert_eq!(report.translations[0].text, "[0, 0]");
        assert_eq!(report.translations[19].key, UnitKey::chapter(1, 19));
        assert_eq!(report.translations[19].text, "[19, 0]");
    }

    #[test]
    fn zero_workers_still_makes_progress() {
        let pool = WorkerPool::start(0, echo_factory).unwrap();
        assert_eq!(pool.size(), 1);
        let report = pool
            .dispatch(vec![EncodedUnit::new(UnitKey::flat(1), vec![5])])
            .unwrap();
        assert_eq!(report.translations.len(), 1);
    }

    #[test]
    fn each_worker_loads_its_engine_once() {
        let loads = Arc::new(AtomicUsize::new(0));
        let counter = loads.clone();
        let pool = WorkerPool::start(2, move || -> Result<Box<dyn Engine>> {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(Echo))
        })
        .unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 0);

        for _ in 0..3 {
            let units = (0..10).map(|p| EncodedUnit::new(UnitKey::flat(p), vec![1])).collect();
            pool.dispatch(units).unwrap();
        }
        assert!(loads.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn load_failures_fail_units_and_are_retried() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let pool = WorkerPool::start(1, move || -> Result<Box<dyn Engine>> {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(anyhow!("model directory is missing"))
            } else {
                Ok(Box::new(Echo))
            }
        })
        .unwrap();

        let units = (0..3).map(|p| EncodedUnit::new(UnitKey::flat(p), vec![1])).collect();
        let report = pool.dispatch(units).unwrap();
        assert_eq!(report.failures.len(), 1);
        assert!(report.failures[0].reason.contains("model directory is missing"));
        assert_eq!(report.translations.len(), 2);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    /// Holds up the unit at position 0 and records completion order.
    struct SlowFirst {
        done: Arc<Mutex<Vec<UnitKey>>>,
    }

    impl Engine for SlowFirst {
        fn translate(&self, unit: &EncodedUnit) -> Result<String> {
            if unit.key.position == 0 {
                thread::sleep(Duration::from_millis(300));
            }
            self.done.lock().unwrap().push(unit.key);
            Ok(format!("{:?}", unit.input_ids))
        }
    }

    #[test]
    fn out_of_order_completions_are_matched_by_key() {
        let done = Arc::new(Mutex::new(Vec::new()));
        let recorder = done.clone();
        let pool = WorkerPool::start(2, move || -> Result<Box<dyn Engine>> {
            Ok(Box::new(SlowFirst {
                done: recorder.clone(),
            }))
        })
        .unwrap();

        let units = (0..6)
            .map(|p| EncodedUnit::new(UnitKey::flat(p), vec![100 + p as i64]))
            .collect();
        let report = pool.dispatch(units).unwrap();

        let done = done.lock().unwrap();
        assert_eq!(done.len(), 6);
        assert_eq!(done.last(), Some(&UnitKey::flat(0)));

        assert!(report.failures.is_empty());
        for (p, t) in report.translations.iter().enumerate() {
            assert_eq!(t.key, UnitKey::flat(p as u32));
            assert_eq!(t.text, format!("[{}]", 100 + p));
        }
    }

    #[test]
    fn checked_start_fails_without_a_model() {
        let loads = Arc::new(AtomicUsize::new(0));
        let counter = loads.clone();
        let res = WorkerPool::start_checked(2, move || -> Result<Box<dyn Engine>> {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(anyhow!("failed to initialize a translator"))
        });

        let err = res.err().unwrap();
        assert!(format!("{err:#}").contains("failed to initialize a translator"));
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn checked_start_with_a_model_translates() {
        let pool = WorkerPool::start_checked(1, echo_factory).unwrap();
        let report = pool
            .dispatch(vec![EncodedUnit::new(UnitKey::flat(0), vec![7])])
            .unwrap();
        assert_eq!(report.translations[0].text, "[7]");
    }

    #[test]
    fn dropping_the_pool_joins_workers() {
        let pool = WorkerPool::start(4, echo_factory).unwrap();
        drop(pool);
    }
}
