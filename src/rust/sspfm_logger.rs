use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Console and file logger shared by the stage drivers and their workers.
#[derive(Clone)]
pub struct Logger {
    console_output_enabled: bool,
    file_output_enabled: bool,
    verbose: bool,
    file_handle: Option<Arc<Mutex<File>>>,
}

impl Default for Logger {
    fn default() -> Self {
        Self::new()
    }
}

impl Logger {
    pub fn new() -> Self {
        Logger {
            console_output_enabled: true,
            file_output_enabled: false,
            verbose: false,
            file_handle: None,
        }
    }

    pub fn setup(&mut self, console_enabled: bool, file_enabled: bool, filepath: Option<&Path>) -> io::Result<()> {
        self.console_output_enabled = console_enabled;
        self.file_output_enabled = file_enabled;

        if self.file_output_enabled {
            if let Some(path) = filepath {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)?;
                self.file_handle = Some(Arc::new(Mutex::new(file)));
            } else {
                return Err(io::Error::new(io::ErrorKind::InvalidInput, "File output is enabled but no log file path was given."));
            }
        }
        Ok(())
    }

    pub fn set_verbose(&mut self, verbose: bool) {
        self.verbose = verbose;
    }

    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    pub fn log(&self, message: &str) {
        if self.console_output_enabled {
            println!("{}", message);
        }
        if self.file_output_enabled {
            if let Some(file_handle) = &self.file_handle {
                // a poisoned lock only means another worker panicked mid-write
                let mut file = match file_handle.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                if let Err(e) = writeln!(file, "{}", message) {
                    eprintln!("Log file write error: {}", e);
                }
            }
        }
    }

    pub fn log_fmt(&self, args: std::fmt::Arguments) {
        self.log(&format!("{}", args));
    }

    /// Only emitted when the run was started with `verbose`.
    pub fn log_verbose(&self, args: std::fmt::Arguments) {
        if self.verbose {
            self.log_fmt(args);
        }
    }

    pub fn warn(&self, args: std::fmt::Arguments) {
        self.log(&format!("Warning: {}", args));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::Read;
    use tempfile::tempdir;

    #[test]
    fn test_logger_console_output() {
        let logger = Logger::new();
        logger.log("Test message to console");
        logger.log_fmt(format_args!("Formatted test message: {}", 123));
    }

    #[test]
    fn test_logger_file_output() -> io::Result<()> {
        let dir = tempdir()?;
        let file_path = dir.path().join("test_log.txt");

        let mut logger = Logger::new();
        logger.setup(false, true, Some(&file_path))?;

        logger.log("First log entry.");
        logger.log_fmt(format_args!("Second log entry: {}", "data"));
        logger.warn(format_args!("pixel {} skipped", 4));

        let mut file = File::open(&file_path)?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;

        assert!(contents.contains("First log entry."));
        assert!(contents.contains("Second log entry: data"));
        assert!(contents.contains("Warning: pixel 4 skipped"));
        assert_eq!(contents.lines().count(), 3);

        Ok(())
    }

    #[test]
    fn test_logger_verbose_gate() -> io::Result<()> {
        let dir = tempdir()?;
        let file_path = dir.path().join("verbose_log.txt");

        let mut logger = Logger::new();
        logger.setup(false, true, Some(&file_path))?;
        logger.log_verbose(format_args!("hidden"));
        logger.set_verbose(true);
        logger.log_verbose(format_args!("shown"));

        let contents = fs::read_to_string(&file_path)?;
        assert!(!contents.contains("hidden"));
        assert!(contents.contains("shown"));
        Ok(())
    }

    #[test]
    fn test_logger_no_output() -> io::Result<()> {
        let dir = tempdir()?;
        let file_path = dir.path().join("test_log_no_output.txt");

        let mut logger = Logger::new();
        logger.setup(false, false, Some(&file_path))?;

        logger.log("This should not appear anywhere.");

        assert!(!file_path.exists() || fs::read_to_string(&file_path)?.is_empty());

        Ok(())
    }

    #[test]
    fn test_logger_requires_path_for_file_output() {
        let mut logger = Logger::new();
        assert!(logger.setup(false, true, None).is_err());
    }
}
