//! Job scheduling type definitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Catalog-assigned job identifier; zero means "not yet assigned"
pub type JobId = u32;

/// Kind of work a job performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum JobType {
    Backup,
    Verify,
    Restore,
    Admin,
    Migrate,
    Copy,
}

impl JobType {
    /// Single character code used in catalog records
    pub fn code(self) -> char {
        match self {
            JobType::Backup => 'B',
            JobType::Verify => 'V',
            JobType::Restore => 'R',
            JobType::Admin => 'D',
            JobType::Migrate => 'M',
            JobType::Copy => 'Y',
        }
    }

    /// Read jobs claim their storage exclusively instead of counting against its limit
    pub fn needs_exclusive_storage(self) -> bool {
        matches!(self, JobType::Restore | JobType::Verify)
    }
}

/// Backup or verify level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[strum(ascii_case_insensitive)]
pub enum JobLevel {
    Full,
    Incremental,
    Differential,
    Since,
    VerifyCatalog,
    VerifyInit,
    VerifyVolumeToCatalog,
    VerifyDiskToCatalog,
    VerifyData,
    Base,
    None,
}

impl JobLevel {
    pub fn code(self) -> char {
        match self {
            JobLevel::Full => 'F',
            JobLevel::Incremental => 'I',
            JobLevel::Differential => 'D',
            JobLevel::Since => 'S',
            JobLevel::VerifyCatalog => 'C',
            JobLevel::VerifyInit => 'V',
            JobLevel::VerifyVolumeToCatalog => 'O',
            JobLevel::VerifyDiskToCatalog => 'd',
            JobLevel::VerifyData => 'A',
            JobLevel::Base => 'B',
            JobLevel::None => ' ',
        }
    }

    /// Level used when neither the job nor the run clause names one
    pub fn default_for(job_type: JobType) -> Self {
        match job_type {
            JobType::Verify => JobLevel::VerifyCatalog,
            JobType::Backup => JobLevel::Incremental,
            JobType::Restore | JobType::Admin => JobLevel::None,
            _ => JobLevel::Full,
        }
    }
}

/// Externally visible job status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum JobStatus {
    Created,
    Running,
    Blocked,
    Terminated,
    ErrorTerminated,
    NonFatalError,
    FatalError,
    Differences,
    Canceled,
    WaitFD,
    WaitSD,
    WaitMedia,
    WaitMount,
    WaitStoreRes,
    WaitJobRes,
    WaitClientRes,
    WaitMaxJobs,
    WaitStartTime,
    WaitPriority,
}

impl JobStatus {
    /// Single character status code as stored in the catalog
    pub fn code(self) -> char {
        match self {
            JobStatus::Created => 'C',
            JobStatus::Running => 'R',
            JobStatus::Blocked => 'B',
            JobStatus::Terminated => 'T',
            JobStatus::ErrorTerminated => 'E',
            JobStatus::NonFatalError => 'e',
            JobStatus::FatalError => 'f',
            JobStatus::Differences => 'D',
            JobStatus::Canceled => 'A',
            JobStatus::WaitFD => 'F',
            JobStatus::WaitSD => 'S',
            JobStatus::WaitMedia => 'm',
            JobStatus::WaitMount => 'M',
            JobStatus::WaitStoreRes => 's',
            JobStatus::WaitJobRes => 'j',
            JobStatus::WaitClientRes => 'c',
            JobStatus::WaitMaxJobs => 'd',
            JobStatus::WaitStartTime => 't',
            JobStatus::WaitPriority => 'p',
        }
    }

    /// Canceled, or ended in an error that stops further processing
    pub fn is_canceled(self) -> bool {
        matches!(
            self,
            JobStatus::Canceled | JobStatus::ErrorTerminated | JobStatus::FatalError
        )
    }

    /// Still queued: created but not yet admitted to run
    pub fn is_queued(self) -> bool {
        matches!(
            self,
            JobStatus::Created
                | JobStatus::WaitStoreRes
                | JobStatus::WaitJobRes
                | JobStatus::WaitClientRes
                | JobStatus::WaitPriority
                | JobStatus::WaitMaxJobs
                | JobStatus::WaitStartTime
        )
    }

    /// Blocked on a resource or a remote daemon rather than transferring data
    pub fn is_waiting(self) -> bool {
        self.is_queued()
            || matches!(
                self,
                JobStatus::Blocked
                    | JobStatus::WaitFD
                    | JobStatus::WaitSD
                    | JobStatus::WaitMedia
                    | JobStatus::WaitMount
            )
    }

    /// Final status written to the end record
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Terminated
                | JobStatus::ErrorTerminated
                | JobStatus::FatalError
                | JobStatus::Differences
                | JobStatus::Canceled
        )
    }

    /// Text substituted for `%e` in run script commands
    pub fn exit_text(self) -> &'static str {
        match self {
            JobStatus::Terminated => "OK",
            JobStatus::Canceled => "Canceled",
            JobStatus::Differences => "Differences",
            JobStatus::ErrorTerminated | JobStatus::FatalError => "Error",
            JobStatus::Running => "Running",
            _ => "Unknown term code",
        }
    }
}

/// Lifecycle milestones broadcast to subscribers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
pub enum JobEventKind {
    JobStart,
    JobInit,
    JobRun,
    JobEnd,
    Rescheduled,
    Canceled,
}

/// A lifecycle event for one job instance
#[derive(Debug, Clone, Serialize)]
pub struct JobEvent {
    pub kind: JobEventKind,
    pub job_id: JobId,
    /// Unique job name
    pub job: String,
    pub status: JobStatus,
    pub at: DateTime<Utc>,
}
