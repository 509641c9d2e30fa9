use log::{Level, LevelFilter, Metadata, Record, SetLoggerError};
use once_cell::sync::OnceCell;
use std::fs::{OpenOptions, create_dir_all};
use std::io::Write;
use std::path::PathBuf;

#[derive(Debug)]
struct FileLogger {
    log_path: PathBuf,
}

static LOGGER: OnceCell<FileLogger> = OnceCell::new();

impl log::Log for FileLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Debug
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let mut log_entry = String::new();
            log_entry.push_str(
                &chrono::Local::now()
                    .format("%d/%m/%Y %H:%M:%S ")
                    .to_string(),
            );
            log_entry.push_str(&format!("{} - {}\n", record.level(), record.args()));
            let log_file = self.log_path.join("fateloom.log");

            if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(log_file) {
                let _ = file.write_all(log_entry.as_bytes());
            }
        }
    }

    fn flush(&self) {}
}

/// Logs land next to the campaign database; the engine's stdout stays
/// reserved for the narrator.
pub fn init(data_dir: PathBuf) -> Result<(), SetLoggerError> {
    create_dir_all(&data_dir).expect("could not create log directory");

    LOGGER
        .set(FileLogger { log_path: data_dir })
        .expect("logger already set");

    log::set_logger(LOGGER.get().expect("logger just set"))
        .map(|()| log::set_max_level(LevelFilter::Debug))
}
