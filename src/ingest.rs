pub mod bulk;
pub mod fetcher;
pub mod filter;
pub mod normalize;
mod report;
mod runner;


pub use bulk::{BulkError, BulkIngestReport, BulkIngestRequest, BulkIngestor, BulkKind, KindCounts};
pub use fetcher::{report_url, HttpReportFetcher, ReportSource, ReportWindow};
pub use filter::{FilterCounts, FilterDecision};
pub use normalize::{parse_report, ParseStats, ParsedReport};
pub use report::{RunReport, SensorOutcome, SensorStatus};
pub use runner::{IngestSettings, IngestionRunner};
