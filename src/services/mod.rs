pub mod csv_writer;
pub mod normalizer;
pub mod recognizer;
pub mod run_catalog;
pub mod scraper;
pub mod text_correction;
pub mod traffic_extractor;

pub use normalizer::{convert, UnitHeuristic, ValueNormalizer};
pub use recognizer::{Recognizer, VisionLlmRecognizer};
pub use scraper::{CactiScraper, GraphScraper, ScrapeRequest};
