//! Online load generators
//!
//! Each generator kind runs on `thread_count` threads at its configured rate
//! while the batch (or nothing else) runs. All generators of one run share a
//! single contract key selector and a single contract generator.

pub mod app;
pub mod history_insert;
pub mod history_update;
pub mod key_selector;
pub mod master_delete_insert;
pub mod master_insert;
pub mod master_update;
pub mod scheduler;

pub use app::{LoadGenerator, OnlineApp};
pub use key_selector::RandomKeySelector;
pub use scheduler::{Schedule, Tick};

use chrono::{Duration as ChronoDuration, NaiveTime};
use phonebill_core::{
    models::ContractKey, traits::Database, AppConfig, AppError, AppResult, TxLabel, TxOption,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::constants::{CREATE_SCHEDULE_INTERVAL_MILLS, WORKER_POLL_INTERVAL};
use crate::statistics::TxStatistics;
use crate::testdata::{ContractGenerator, HistoryGenerator};
use crate::transaction::TransactionRunner;
use history_insert::HistoryInsert;
use history_update::HistoryUpdate;
use master_delete_insert::MasterDeleteInsert;
use master_insert::MasterInsert;
use master_update::MasterUpdate;

/// Applications ready to start
pub struct OnlineApps {
    apps: Vec<OnlineApp>,
    terminate: Arc<AtomicBool>,
}

impl OnlineApps {
    pub fn new(apps: Vec<OnlineApp>) -> Self {
        let terminate = Arc::new(AtomicBool::new(false));
        let apps = apps
            .into_iter()
            .map(|mut app| {
                app.set_terminate_flag(Arc::clone(&terminate));
                app
            })
            .collect();
        Self { apps, terminate }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    pub fn len(&self) -> usize {
        self.apps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.apps.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.apps.iter().map(OnlineApp::name).collect()
    }

    /// Start every application on its own thread
    ///
    /// An application whose run loop fails ends the process with status 1.
    pub fn start(self) -> AppResult<RunningApps> {
        let mut handles = Vec::with_capacity(self.apps.len());
        for app in self.apps {
            let name = app.name().to_string();
            let handle = thread::Builder::new().name(name.clone()).spawn(move || {
                if let Err(e) = app.run() {
                    error!("Aborting by error: {}", e);
                    std::process::exit(1);
                }
            })?;
            handles.push((name, handle));
        }
        if !handles.is_empty() {
            info!("{} online applications started", handles.len());
        }
        Ok(RunningApps {
            handles,
            terminate: self.terminate,
        })
    }
}

/// Applications running on their threads
pub struct RunningApps {
    handles: Vec<(String, JoinHandle<()>)>,
    terminate: Arc<AtomicBool>,
}

impl RunningApps {
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Ask every application to stop
    pub fn terminate(&self) {
        self.terminate.store(true, Ordering::SeqCst);
    }

    /// Stop every application and wait at most `timeout` for them
    ///
    /// Returns false when some application was still running at the deadline.
    pub fn terminate_and_wait(self, timeout: Duration) -> bool {
        self.terminate();
        let deadline = Instant::now() + timeout;
        let mut pending = self.handles;
        while !pending.is_empty() {
            let (done, running): (Vec<_>, Vec<_>) =
                pending.into_iter().partition(|(_, handle)| handle.is_finished());
            pending = running;
            for (name, handle) in done {
                if handle.join().is_err() {
                    error!("Online application {} panicked", name);
                }
            }
            if pending.is_empty() {
                break;
            }
            if Instant::now() >= deadline {
                let names: Vec<&str> = pending.iter().map(|(name, _)| name.as_str()).collect();
                warn!("Online applications did not stop in time: {}", names.join(", "));
                return false;
            }
            thread::sleep(WORKER_POLL_INTERVAL);
        }
        info!("All online applications stopped");
        true
    }
}

/// Shared pieces every application of one run is built from
struct Factory<'a> {
    config: &'a AppConfig,
    database: &'a Arc<dyn Database>,
    runner: &'a TransactionRunner,
    statistics: &'a Arc<TxStatistics>,
    rng: StdRng,
}

impl Factory<'_> {
    fn app(
        &mut self,
        number: usize,
        generator: Box<dyn LoadGenerator>,
        exec_per_min: i32,
    ) -> OnlineApp {
        let rng = StdRng::seed_from_u64(self.rng.gen());
        OnlineApp::new(
            number,
            generator,
            exec_per_min,
            Arc::clone(self.database),
            self.runner.clone(),
            Arc::clone(self.statistics),
            rng,
            self.config.online.skip_database_access,
        )
    }

    fn child_rng(&mut self) -> StdRng {
        StdRng::seed_from_u64(self.rng.gen())
    }
}

/// Build every configured online application
///
/// Needs the contracts table to be filled: the key selector is built from the
/// contract keys found in the database.
pub fn create_online_apps(
    config: &AppConfig,
    database: Arc<dyn Database>,
    runner: &TransactionRunner,
    statistics: Arc<TxStatistics>,
) -> AppResult<OnlineApps> {
    let online = &config.online;
    if !online.has_online_app() {
        return Ok(OnlineApps::empty());
    }

    let option = TxOption::occ(3, TxLabel::Initialize);
    let mut session = database.open_session()?;
    let keys: Vec<ContractKey> =
        runner.execute(session.as_mut(), &option, |s| s.contracts().get_all_keys())?;
    let max_start_time =
        runner.execute(session.as_mut(), &option, |s| s.histories().get_max_start_time())?;
    session.close()?;
    if keys.is_empty() {
        return Err(AppError::InvalidData(
            "Insufficient test data, create test data first".to_string(),
        ));
    }
    let contract_count = keys.len() as u64;

    let mut factory = Factory {
        config,
        database: &database,
        runner,
        statistics: &statistics,
        rng: StdRng::seed_from_u64(config.random_seed),
    };
    let selector = Arc::new(RandomKeySelector::new(
        keys,
        factory.child_rng(),
        online.random_at_least_once_rate,
        online.random_cover_rate,
    )?);
    let contracts = Arc::new(
        ContractGenerator::new(&config.test_data, config.random_seed)?
            .starting_at(contract_count.max(config.test_data.number_of_contracts_records)),
    );

    let mut apps = Vec::new();
    let enabled = |rate: i32, threads: usize| if rate == 0 { 0 } else { threads };

    for i in 0..enabled(
        online.master_delete_insert_records_per_min,
        online.master_delete_insert_thread_count,
    ) {
        let generator = MasterDeleteInsert::new(Arc::clone(&selector));
        apps.push(factory.app(i, Box::new(generator), online.master_delete_insert_records_per_min));
    }
    for i in 0..enabled(online.master_update_records_per_min, online.master_update_thread_count) {
        let generator = MasterUpdate::new(
            Arc::clone(&selector),
            factory.child_rng(),
            config.test_data.max_date,
        );
        apps.push(factory.app(i, Box::new(generator), online.master_update_records_per_min));
    }
    for i in 0..enabled(online.master_insert_records_per_min, online.master_insert_thread_count) {
        let generator = MasterInsert::new(Arc::clone(&contracts));
        apps.push(factory.app(i, Box::new(generator), online.master_insert_records_per_min));
    }

    let history_inserts = enabled(
        online.history_insert_transaction_per_min,
        online.history_insert_thread_count,
    );
    if history_inserts > 0 {
        let duration = CREATE_SCHEDULE_INTERVAL_MILLS / history_inserts as i64;
        let first_day = config
            .test_data
            .history_max_date
            .succ_opt()
            .ok_or_else(|| AppError::Config("test_data.history_max_date out of range".to_string()))?
            .and_time(NaiveTime::MIN);
        let mut base_time = max_start_time.map_or(first_day, |t| t.max(first_day));
        for i in 0..history_inserts {
            let histories = HistoryGenerator::new(
                Arc::clone(&contracts),
                config.test_data.number_of_contracts_records,
                config.test_data.max_call_time_secs,
                factory.child_rng(),
            );
            let generator = HistoryInsert::new(
                histories,
                online.history_insert_records_per_transaction,
                base_time,
                duration,
            );
            let rate = online.history_insert_transaction_per_min;
            apps.push(factory.app(i, Box::new(generator), rate));
            base_time += ChronoDuration::milliseconds(duration);
        }
    }

    for i in 0..enabled(online.history_update_records_per_min, online.history_update_thread_count) {
        let generator = HistoryUpdate::new(
            Arc::clone(&selector),
            factory.child_rng(),
            config.test_data.max_call_time_secs,
            online.skip_database_access,
        );
        apps.push(factory.app(i, Box::new(generator), online.history_update_records_per_min));
    }

    let apps = OnlineApps::new(apps);
    info!("Online applications: {}", apps.names().join(", "));
    Ok(apps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testdata::create_test_data;
    use crate::transaction::TxCounters;
    use phonebill_db::MemoryDatabase;

    fn runner() -> TransactionRunner {
        TransactionRunner::new(Arc::new(TxCounters::new()))
    }

    fn seeded(config: &AppConfig) -> Arc<dyn Database> {
        let db = MemoryDatabase::new();
        create_test_data(&db, &runner(), &config.test_data, config.random_seed).unwrap();
        Arc::new(db)
    }

    fn config() -> AppConfig {
        let mut config = AppConfig::default();
        config.test_data.number_of_contracts_records = 200;
        config.test_data.number_of_history_records = 200;
        config.online.master_update_records_per_min = 60;
        config.online.master_delete_insert_records_per_min = 60;
        config.online.history_insert_transaction_per_min = 60;
        config.online.history_insert_thread_count = 3;
        config.online.history_update_records_per_min = -1;
        config.online.history_update_thread_count = 0;
        config
    }

    #[test]
    fn test_disabled_generators_are_not_built() {
        let config = config();
        let apps = create_online_apps(
            &config,
            seeded(&config),
            &runner(),
            Arc::new(TxStatistics::new()),
        )
        .unwrap();

        assert_eq!(
            apps.names(),
            vec![
                "MasterDeleteInsertApp-000",
                "MasterUpdateApp-000",
                "HistoryInsertApp-000",
                "HistoryInsertApp-001",
                "HistoryInsertApp-002",
            ]
        );
    }

    #[test]
    fn test_no_online_app_configured() {
        let config = AppConfig::default();
        let apps = create_online_apps(
            &config,
            Arc::new(MemoryDatabase::new()),
            &runner(),
            Arc::new(TxStatistics::new()),
        )
        .unwrap();
        assert!(apps.is_empty());
    }

    #[test]
    fn test_empty_contracts_rejected() {
        let config = config();
        let result = create_online_apps(
            &config,
            Arc::new(MemoryDatabase::new()),
            &runner(),
            Arc::new(TxStatistics::new()),
        );
        assert!(matches!(result, Err(AppError::InvalidData(_))));
    }

    #[test]
    fn test_start_and_terminate() {
        let config = config();
        let apps = create_online_apps(
            &config,
            seeded(&config),
            &runner(),
            Arc::new(TxStatistics::new()),
        )
        .unwrap();
        let running = apps.start().unwrap();
        assert_eq!(running.len(), 5);
        thread::sleep(Duration::from_millis(100));
        assert!(running.terminate_and_wait(Duration::from_secs(10)));
    }
}
