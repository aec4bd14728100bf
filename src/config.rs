//! Engine configuration: page and buffer sizing, volume specifications,
//! journal layout, commit policy, and the background worker cadences.
//! Built in code with builder-style helpers; `VolumeSpec::parse` accepts
//! the `volume.<n>` specification string form.

use std::path::PathBuf;

use crate::error::{Error, Result};

/// Smallest supported page size.
pub const MIN_PAGE_SIZE: usize = 1024;
/// Largest supported page size.
pub const MAX_PAGE_SIZE: usize = 16384;

/// Durability policy applied when a transaction commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitPolicy {
    /// Return once the journal buffer accepted the record; a background
    /// force happens within the flush interval.
    Soft,
    /// Force the journal before returning.
    Hard,
    /// Park briefly so concurrent committers share one force.
    Group,
}

/// Declarative description of one volume file.
#[derive(Debug, Clone)]
pub struct VolumeSpec {
    pub path: PathBuf,
    pub name: String,
    pub create: bool,
    pub create_only: bool,
    pub read_only: bool,
    pub initial_pages: u64,
    pub maximum_pages: u64,
    pub extension_pages: u64,
}

impl VolumeSpec {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "volume".to_owned());
        Self {
            path,
            name,
            create: true,
            create_only: false,
            read_only: false,
            initial_pages: 32,
            maximum_pages: u64::MAX / MAX_PAGE_SIZE as u64,
            extension_pages: 32,
        }
    }

    /// Parses a `volume.<n>` specification string:
    /// `path[,create|,createOnly|,readOnly][,initialPages:n][,maximumPages:n][,extensionPages:n]`.
    pub fn parse(spec: &str) -> Result<Self> {
        let mut parts = spec.split(',').map(str::trim);
        let path = parts
            .next()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| Error::InvalidArgument(format!("empty volume spec: {spec:?}")))?;
        let mut out = VolumeSpec::new(path);
        out.create = false;
        for part in parts {
            if part.is_empty() {
                continue;
            }
            match part.split_once(':') {
                None => match part {
                    "create" => out.create = true,
                    "createOnly" => {
                        out.create = true;
                        out.create_only = true;
                    }
                    "readOnly" => out.read_only = true,
                    other => {
                        return Err(Error::InvalidArgument(format!(
                            "unrecognized volume flag {other:?} in {spec:?}"
                        )))
                    }
                },
                Some((key, value)) => {
                    let value: u64 = value.parse().map_err(|_| {
                        Error::InvalidArgument(format!("bad number for {key:?} in {spec:?}"))
                    })?;
                    match key {
                        "initialPages" => out.initial_pages = value,
                        "maximumPages" => out.maximum_pages = value,
                        "extensionPages" => out.extension_pages = value,
                        other => {
                            return Err(Error::InvalidArgument(format!(
                                "unrecognized volume option {other:?} in {spec:?}"
                            )))
                        }
                    }
                }
            }
        }
        if out.initial_pages == 0 || out.maximum_pages < out.initial_pages {
            return Err(Error::InvalidArgument(format!(
                "volume page bounds out of order in {spec:?}"
            )));
        }
        Ok(out)
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub datapath: PathBuf,
    pub journalpath: Option<PathBuf>,
    pub page_size: usize,
    pub buffer_count: usize,
    pub volumes: Vec<VolumeSpec>,
    pub append_only: bool,
    pub commit_policy: CommitPolicy,
    pub transaction_commit_lead_ns: u64,
    pub transaction_commit_stall_ns: u64,
    pub checkpoint_interval_s: u64,
    pub journal_segment_size: u64,
    pub journal_flush_interval_ms: u64,
    pub max_free_list_size: usize,
    pub max_free_delta_list_size: usize,
    pub long_running_threshold: usize,
    pub cache_poll_interval_ms: u64,
    pub cleanup_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            datapath: PathBuf::from("."),
            journalpath: None,
            page_size: 16384,
            buffer_count: 512,
            volumes: Vec::new(),
            append_only: false,
            commit_policy: CommitPolicy::Group,
            transaction_commit_lead_ns: 0,
            transaction_commit_stall_ns: 1_000_000,
            checkpoint_interval_s: 10,
            journal_segment_size: 16 * 1024 * 1024,
            journal_flush_interval_ms: 10,
            max_free_list_size: 32,
            max_free_delta_list_size: 16,
            long_running_threshold: 256,
            cache_poll_interval_ms: 10,
            cleanup_interval_ms: 500,
        }
    }
}

impl Config {
    pub fn new(datapath: impl Into<PathBuf>) -> Self {
        Self {
            datapath: datapath.into(),
            ..Self::default()
        }
    }

    pub fn with_volume(mut self, spec: VolumeSpec) -> Self {
        self.volumes.push(spec);
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_buffer_count(mut self, count: usize) -> Self {
        self.buffer_count = count;
        self
    }

    pub fn with_commit_policy(mut self, policy: CommitPolicy) -> Self {
        self.commit_policy = policy;
        self
    }

    /// Journal file prefix; defaults to `<datapath>/tessera_journal`.
    pub fn journal_prefix(&self) -> PathBuf {
        self.journalpath
            .clone()
            .unwrap_or_else(|| self.datapath.join("tessera_journal"))
    }

    pub fn validate(&self) -> Result<()> {
        if !self.page_size.is_power_of_two()
            || !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&self.page_size)
        {
            return Err(Error::InvalidArgument(format!(
                "page size {} must be a power of two in [{MIN_PAGE_SIZE}, {MAX_PAGE_SIZE}]",
                self.page_size
            )));
        }
        if self.buffer_count < 8 {
            return Err(Error::InvalidArgument(
                "buffer count must be at least 8".into(),
            ));
        }
        if self.volumes.is_empty() {
            return Err(Error::InvalidArgument(
                "at least one volume must be configured".into(),
            ));
        }
        if self.journal_segment_size < 4 * self.page_size as u64 {
            return Err(Error::InvalidArgument(
                "journal segment size too small for page records".into(),
            ));
        }
        Ok(())
    }
}
