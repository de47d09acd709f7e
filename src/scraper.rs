use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use indicatif::{ProgressBar, ProgressStyle};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::browser::{PageClient, PageError};
use crate::model::{
    listing_url, merge_observations, ItemDescriptor, ListType, PriceMap, PriceObservation,
};
use crate::parser;
use crate::report::ReportSink;
use crate::settings::Settings;

/// What one page visit produced.
#[derive(Debug, Clone, PartialEq)]
pub enum VisitOutcome {
    Priced(PriceMap),
    /// Page loaded but no wear button carried a price.
    Empty,
    Failed(PageError),
}

impl VisitOutcome {
    /// Empty and failed visits both count as "no prices" downstream.
    pub fn prices(&self) -> PriceMap {
        match self {
            VisitOutcome::Priced(p) => *p,
            VisitOutcome::Empty | VisitOutcome::Failed(_) => PriceMap::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum CollectError {
    #[error("run cancelled")]
    Cancelled,
    #[error("bad listing url: {0}")]
    Url(#[from] url::ParseError),
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunStats {
    pub items: usize,
    pub items_ok: usize,
    pub items_failed: usize,
    pub pages_priced: usize,
    pub pages_empty: usize,
    pub pages_failed: usize,
    pub records_written: usize,
    pub files_written: usize,
}

#[derive(Debug)]
pub struct RunSummary {
    pub stats: RunStats,
    /// Most recent file written; `None` means the run produced no output.
    pub last_output: Option<PathBuf>,
    pub cancelled: bool,
}

/// Sequential price collector: one page at a time, batches flushed to `sink`.
pub struct Collector<'a, P: PageClient, S: ReportSink> {
    settings: &'a Settings,
    client: &'a P,
    sink: S,
    cancel: CancellationToken,
    batch: Vec<PriceObservation>,
    stats: RunStats,
    last_output: Option<PathBuf>,
}

impl<'a, P: PageClient, S: ReportSink> Collector<'a, P, S> {
    pub fn new(settings: &'a Settings, client: &'a P, sink: S, cancel: CancellationToken) -> Self {
        Collector {
            settings,
            client,
            sink,
            cancel,
            batch: Vec::new(),
            stats: RunStats::default(),
            last_output: None,
        }
    }

    pub async fn run(mut self, items: &[ItemDescriptor]) -> Result<RunSummary> {
        let total = items.len();
        let batch_size = self.settings.batch_size.max(1);
        let mut cancelled = false;

        let pb = ProgressBar::new(total as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] {bar:40} {pos}/{len} {msg}")?
                .progress_chars("=> "),
        );

        for (i, item) in items.iter().enumerate() {
            if self.cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            info!("Item [{}/{}]: {}", i + 1, total, item.name);
            pb.set_message(item.name.clone());
            self.stats.items += 1;

            match self.collect_item(item).await {
                Ok(records) => {
                    self.stats.items_ok += 1;
                    self.batch.extend(records);
                }
                Err(CollectError::Cancelled) => {
                    info!("Cancelled while collecting {}; partial records dropped", item.name);
                    cancelled = true;
                    break;
                }
                Err(e) => {
                    error!("Item {} failed: {}", item.name, e);
                    self.stats.items_failed += 1;
                }
            }
            pb.inc(1);

            let processed = i + 1;
            if processed % batch_size == 0 || processed == total {
                if let Err(e) = self.flush() {
                    error!("Flush failed, keeping {} records for the next one: {:#}", self.batch.len(), e);
                }
            }
        }
        pb.finish_and_clear();

        // Picks up what a failed periodic flush or a cancellation left behind.
        self.flush()?;

        let s = &self.stats;
        info!(
            "Collected {} items ({} ok, {} failed); pages {} priced, {} empty, {} failed; {} records in {} files",
            s.items, s.items_ok, s.items_failed, s.pages_priced, s.pages_empty, s.pages_failed,
            s.records_written, s.files_written
        );
        Ok(RunSummary {
            stats: self.stats,
            last_output: self.last_output,
            cancelled,
        })
    }

    /// Sell then rent for each present variant; five records per variant.
    pub async fn collect_item(&mut self, item: &ItemDescriptor) -> Result<Vec<PriceObservation>, CollectError> {
        let mut records = Vec::new();
        for (variant, template_id) in item.variants() {
            info!(item = %item.name, %variant, template_id, "Collecting");
            let mut maps = [PriceMap::default(); 2];
            for (slot, list_type) in ListType::ALL.into_iter().enumerate() {
                if self.cancel.is_cancelled() {
                    return Err(CollectError::Cancelled);
                }
                let url = listing_url(
                    &self.settings.base_url,
                    self.settings.game_id,
                    template_id,
                    list_type,
                )?;
                let outcome = self.visit(url.as_str()).await;
                self.record_outcome(&outcome, list_type, url.as_str());
                maps[slot] = outcome.prices();
                self.pace().await?;
            }
            let [sell, rent] = maps;
            let merged = merge_observations(&item.name, variant, &sell, &rent);
            for r in &merged {
                if r.sell.is_some() || r.rent.is_some() {
                    debug!(
                        "  {}: sell={:?} rent={:?} ratio={:?}",
                        r.wear, r.sell, r.rent, r.rent_ratio()
                    );
                }
            }
            records.extend(merged);
        }
        Ok(records)
    }

    /// One page visit. Never fails; errors become `VisitOutcome::Failed`.
    pub async fn visit(&self, url: &str) -> VisitOutcome {
        match self.fetch_fragments(url).await {
            Ok(fragments) => {
                let prices = parser::extract_prices(&fragments);
                if prices.is_empty() {
                    VisitOutcome::Empty
                } else {
                    VisitOutcome::Priced(prices)
                }
            }
            Err(e) => VisitOutcome::Failed(e),
        }
    }

    async fn fetch_fragments(&self, url: &str) -> Result<Vec<String>, PageError> {
        let settings = self.settings;
        info!("Visiting {}", url);
        self.client.navigate(url).await?;
        self.client
            .wait_for_selector(&settings.price_selector, settings.content_wait())
            .await;

        let mut elements = self.client.query_all(&settings.price_selector).await?;
        if elements.is_empty() {
            elements = self.client.query_all(&settings.fallback_selector).await?;
        }
        debug!("Found {} button elements", elements.len());

        let mut fragments = Vec::with_capacity(elements.len());
        for el in &elements {
            match self.client.read_text(el).await {
                Ok(text) => fragments.push(text),
                Err(e) => debug!("Skipping unreadable element: {}", e),
            }
        }
        Ok(fragments)
    }

    fn record_outcome(&mut self, outcome: &VisitOutcome, list_type: ListType, url: &str) {
        match outcome {
            VisitOutcome::Priced(p) => {
                self.stats.pages_priced += 1;
                info!("Got {} {} prices", p.found(), list_type);
            }
            VisitOutcome::Empty => {
                self.stats.pages_empty += 1;
                warn!("No {} prices on {}", list_type, url);
            }
            VisitOutcome::Failed(e) => {
                self.stats.pages_failed += 1;
                warn!("Failed to read {} page {}: {}", list_type, url, e);
            }
        }
    }

    /// Random delay after every page visit, whatever the visit produced.
    async fn pace(&self) -> Result<(), CollectError> {
        let delay = pacing_delay(self.settings.min_delay_secs, self.settings.max_delay_secs);
        debug!("Sleeping {:.2}s", delay.as_secs_f64());
        tokio::select! {
            _ = tokio::time::sleep(delay) => Ok(()),
            _ = self.cancel.cancelled() => Err(CollectError::Cancelled),
        }
    }

    /// Write the batch and clear it. No-op when nothing is pending.
    fn flush(&mut self) -> Result<()> {
        if self.batch.is_empty() {
            return Ok(());
        }
        let path = self.sink.write_batch(&self.batch)?;
        info!("Saved {} records to {:?}", self.batch.len(), path);
        self.stats.records_written += self.batch.len();
        self.stats.files_written += 1;
        self.last_output = Some(path);
        self.batch.clear();
        Ok(())
    }
}

/// Uniform in `[min, max]` seconds.
pub fn pacing_delay(min_secs: f64, max_secs: f64) -> Duration {
    let secs = if max_secs > min_secs {
        rand::random_range(min_secs..=max_secs)
    } else {
        min_secs
    };
    Duration::from_secs_f64(secs.max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Variant, WearCondition};
    use crate::report::CsvReport;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// In-memory tab: URL → button texts, or a canned failure.
    #[derive(Default)]
    struct FakePage {
        pages: HashMap<String, Result<Vec<String>, PageError>>,
        current: Mutex<Option<String>>,
        visited: Mutex<Vec<String>>,
        /// Buttons only match the looser selector.
        fallback_only: bool,
    }

    impl FakePage {
        fn with(mut self, template_id: &str, list_type: ListType, page: Result<Vec<&str>, PageError>) -> Self {
            let url = listing_url(&Settings::default().base_url, 730, template_id, list_type).unwrap();
            let page = page.map(|v| v.into_iter().map(String::from).collect());
            self.pages.insert(url.to_string(), page);
            self
        }

        fn visited(&self) -> Vec<String> {
            self.visited.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl PageClient for FakePage {
        type Element = String;

        async fn navigate(&self, url: &str) -> Result<(), PageError> {
            self.visited.lock().unwrap().push(url.to_string());
            if let Some(Err(e)) = self.pages.get(url) {
                return Err(e.clone());
            }
            *self.current.lock().unwrap() = Some(url.to_string());
            Ok(())
        }

        async fn wait_for_selector(&self, _selector: &str, _timeout: Duration) -> bool {
            true
        }

        async fn query_all(&self, selector: &str) -> Result<Vec<String>, PageError> {
            let defaults = Settings::default();
            let served = if self.fallback_only {
                defaults.fallback_selector
            } else {
                defaults.price_selector
            };
            if selector != served {
                return Ok(Vec::new());
            }
            let current = self.current.lock().unwrap().clone();
            Ok(current
                .and_then(|url| self.pages.get(&url).cloned())
                .and_then(|page| page.ok())
                .unwrap_or_default())
        }

        async fn read_text(&self, element: &String) -> Result<String, PageError> {
            if element == "<detached>" {
                return Err(PageError::NotFound);
            }
            Ok(element.clone())
        }
    }

    /// Keeps every flushed batch in memory.
    #[derive(Default)]
    struct MemorySink {
        batches: Vec<Vec<PriceObservation>>,
        fail_next: bool,
    }

    impl ReportSink for &mut MemorySink {
        fn write_batch(&mut self, records: &[PriceObservation]) -> Result<PathBuf> {
            if self.fail_next {
                self.fail_next = false;
                anyhow::bail!("disk full");
            }
            self.batches.push(records.to_vec());
            Ok(PathBuf::from(format!("batch_{}.csv", self.batches.len())))
        }
    }

    fn fast_settings() -> Settings {
        Settings {
            min_delay_secs: 0.0,
            max_delay_secs: 0.0,
            content_wait_secs: 0.0,
            ..Settings::default()
        }
    }

    fn items(n: usize) -> Vec<ItemDescriptor> {
        (0..n)
            .map(|i| ItemDescriptor::new(&format!("item {}", i), &format!("{}", i), ""))
            .collect()
    }

    #[tokio::test]
    async fn one_item_two_variants_gives_ten_records() {
        let page = FakePage::default()
            .with("100", ListType::Sell, Ok(vec!["★ StatTrak™ 崭新出厂", "崭新出厂¥100", "久经沙场¥2,329"]))
            .with("100", ListType::Rent, Ok(vec!["崭新出厂¥5/天", "久经沙场¥0.60/天"]))
            .with("200", ListType::Sell, Ok(vec!["略有磨损¥50"]))
            .with("200", ListType::Rent, Err(PageError::Timeout));
        let settings = fast_settings();
        let mut sink = MemorySink::default();
        let catalog = vec![ItemDescriptor::new("Karambit | Doppler", "100", "200")];

        let summary = Collector::new(&settings, &page, &mut sink, CancellationToken::new())
            .run(&catalog)
            .await
            .unwrap();

        assert_eq!(page.visited().len(), 4);
        assert_eq!(sink.batches.len(), 1);
        let rows = &sink.batches[0];
        assert_eq!(rows.len(), 10);
        assert!(rows[..5].iter().all(|r| r.variant == Variant::Standard));
        assert!(rows[5..].iter().all(|r| r.variant == Variant::Premium));

        assert_eq!(rows[0].wear, WearCondition::FactoryNew);
        assert_eq!(rows[0].sell, Some(100.0));
        assert_eq!(rows[0].rent, Some(5.0));
        assert_eq!(format!("{:.4}", rows[0].rent_ratio().unwrap()), "5.0000");
        assert_eq!(rows[2].sell, Some(2329.0));
        assert_eq!(rows[2].rent, Some(0.60));
        assert_eq!(rows[1].sell, None);

        // failed rent page degrades to absent, sell side survives
        assert_eq!(rows[6].wear, WearCondition::MinimalWear);
        assert_eq!(rows[6].sell, Some(50.0));
        assert_eq!(rows[6].rent, None);
        assert!(rows[9].sell.is_none() && rows[9].rent.is_none());

        assert_eq!(summary.stats.pages_priced, 3);
        assert_eq!(summary.stats.pages_failed, 1);
        assert_eq!(summary.stats.records_written, 10);
        assert_eq!(summary.last_output, Some(PathBuf::from("batch_1.csv")));
        assert!(!summary.cancelled);
    }

    #[tokio::test]
    async fn flushes_every_batch_size_items_and_at_end() {
        let page = FakePage::default();
        let settings = fast_settings();
        let mut sink = MemorySink::default();

        let summary = Collector::new(&settings, &page, &mut sink, CancellationToken::new())
            .run(&items(25))
            .await
            .unwrap();

        let sizes: Vec<usize> = sink.batches.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![50, 50, 25]);
        assert_eq!(summary.stats.files_written, 3);
        assert_eq!(summary.stats.pages_empty, 50);
        assert_eq!(summary.last_output, Some(PathBuf::from("batch_3.csv")));
    }

    #[tokio::test]
    async fn exact_multiple_does_not_write_an_extra_file() {
        let page = FakePage::default();
        let settings = fast_settings();
        let mut sink = MemorySink::default();

        Collector::new(&settings, &page, &mut sink, CancellationToken::new())
            .run(&items(20))
            .await
            .unwrap();
        assert_eq!(sink.batches.len(), 2);
    }

    #[tokio::test]
    async fn empty_batch_writes_nothing() {
        let page = FakePage::default();
        let settings = fast_settings();
        let mut sink = MemorySink::default();
        let no_variants = vec![ItemDescriptor::new("ghost", "", "")];

        let summary = Collector::new(&settings, &page, &mut sink, CancellationToken::new())
            .run(&no_variants)
            .await
            .unwrap();
        assert!(sink.batches.is_empty());
        assert!(page.visited().is_empty());
        assert_eq!(summary.last_output, None);
    }

    #[tokio::test]
    async fn failed_pages_still_produce_records() {
        let page = FakePage::default()
            .with("7", ListType::Sell, Err(PageError::Navigation("net::ERR_CONNECTION_RESET".into())))
            .with("7", ListType::Rent, Err(PageError::Timeout));
        let settings = fast_settings();
        let mut sink = MemorySink::default();

        let summary = Collector::new(&settings, &page, &mut sink, CancellationToken::new())
            .run(&[ItemDescriptor::new("x", "7", "")])
            .await
            .unwrap();
        let rows = &sink.batches[0];
        assert_eq!(rows.len(), 5);
        assert!(rows.iter().all(|r| r.sell.is_none() && r.rent.is_none()));
        assert_eq!(summary.stats.pages_failed, 2);
        assert_eq!(summary.stats.items_ok, 1);
    }

    #[tokio::test]
    async fn empty_and_failed_visits_are_distinct() {
        let page = FakePage::default()
            .with("1", ListType::Sell, Ok(vec!["崭新出厂 暂无"]))
            .with("2", ListType::Sell, Err(PageError::Timeout));
        let settings = fast_settings();
        let mut sink = MemorySink::default();
        let c = Collector::new(&settings, &page, &mut sink, CancellationToken::new());

        let sell_1 = listing_url(&settings.base_url, 730, "1", ListType::Sell).unwrap();
        let sell_2 = listing_url(&settings.base_url, 730, "2", ListType::Sell).unwrap();
        assert_eq!(c.visit(sell_1.as_str()).await, VisitOutcome::Empty);
        assert_eq!(
            c.visit(sell_2.as_str()).await,
            VisitOutcome::Failed(PageError::Timeout)
        );
    }

    #[tokio::test]
    async fn unreadable_element_is_skipped() {
        let page = FakePage::default().with("3", ListType::Sell, Ok(vec!["<detached>", "战痕累累¥12"]));
        let settings = fast_settings();
        let mut sink = MemorySink::default();
        let c = Collector::new(&settings, &page, &mut sink, CancellationToken::new());

        let url = listing_url(&settings.base_url, 730, "3", ListType::Sell).unwrap();
        let prices = c.visit(url.as_str()).await.prices();
        assert_eq!(prices.get(WearCondition::BattleScarred), Some(12.0));
    }

    #[tokio::test]
    async fn falls_back_to_looser_selector() {
        let mut page = FakePage::default().with("4", ListType::Rent, Ok(vec!["略有磨损¥3.5/天"]));
        page.fallback_only = true;
        let settings = fast_settings();
        let mut sink = MemorySink::default();
        let c = Collector::new(&settings, &page, &mut sink, CancellationToken::new());

        let url = listing_url(&settings.base_url, 730, "4", ListType::Rent).unwrap();
        let prices = c.visit(url.as_str()).await.prices();
        assert_eq!(prices.get(WearCondition::MinimalWear), Some(3.5));
        assert_eq!(prices.found(), 1);
    }

    #[tokio::test]
    async fn item_error_skips_to_next_item() {
        let page = FakePage::default();
        let settings = Settings {
            base_url: "not a url".into(),
            ..fast_settings()
        };
        let mut sink = MemorySink::default();

        let summary = Collector::new(&settings, &page, &mut sink, CancellationToken::new())
            .run(&items(3))
            .await
            .unwrap();
        assert_eq!(summary.stats.items_failed, 3);
        assert!(sink.batches.is_empty());
        assert_eq!(summary.last_output, None);
    }

    #[tokio::test]
    async fn failed_periodic_flush_is_retried() {
        let page = FakePage::default();
        let settings = Settings {
            batch_size: 2,
            ..fast_settings()
        };
        let mut sink = MemorySink {
            fail_next: true,
            ..MemorySink::default()
        };

        let summary = Collector::new(&settings, &page, &mut sink, CancellationToken::new())
            .run(&items(3))
            .await
            .unwrap();
        let sizes: Vec<usize> = sink.batches.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![15]);
        assert_eq!(summary.stats.records_written, 15);
    }

    #[tokio::test]
    async fn zero_batch_size_flushes_every_item() {
        let page = FakePage::default();
        let settings = Settings {
            batch_size: 0,
            ..fast_settings()
        };
        let mut sink = MemorySink::default();

        Collector::new(&settings, &page, &mut sink, CancellationToken::new())
            .run(&items(3))
            .await
            .unwrap();
        let sizes: Vec<usize> = sink.batches.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![5, 5, 5]);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_visits_are_still_paced() {
        let page = FakePage::default()
            .with("1", ListType::Sell, Err(PageError::Timeout))
            .with("1", ListType::Rent, Err(PageError::Timeout))
            .with("2", ListType::Sell, Err(PageError::Timeout))
            .with("2", ListType::Rent, Err(PageError::Timeout));
        let settings = Settings {
            min_delay_secs: 1.0,
            max_delay_secs: 1.0,
            ..fast_settings()
        };
        let mut sink = MemorySink::default();

        let start = tokio::time::Instant::now();
        let summary = Collector::new(&settings, &page, &mut sink, CancellationToken::new())
            .run(&[ItemDescriptor::new("x", "1", "2")])
            .await
            .unwrap();
        // one delay per visit, four visits
        assert_eq!(start.elapsed(), Duration::from_secs(4));
        assert_eq!(summary.stats.pages_failed, 4);
        assert_eq!(sink.batches.len(), 1);
        assert_eq!(sink.batches[0].len(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_pacing_keeps_finished_items() {
        let page = FakePage::default();
        let settings = Settings {
            min_delay_secs: 1.0,
            max_delay_secs: 1.0,
            ..fast_settings()
        };
        let mut sink = MemorySink::default();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            // item 0 ends at 2s; item 1 is in its first sleep at 2.5s
            tokio::time::sleep(Duration::from_millis(2500)).await;
            trigger.cancel();
        });

        let summary = Collector::new(&settings, &page, &mut sink, cancel)
            .run(&items(5))
            .await
            .unwrap();
        assert!(summary.cancelled);
        assert_eq!(summary.stats.items, 2);
        assert_eq!(summary.stats.items_ok, 1);
        assert_eq!(page.visited().len(), 3);
        assert_eq!(sink.batches.len(), 1);
        let rows = &sink.batches[0];
        assert_eq!(rows.len(), 5);
        assert!(rows.iter().all(|r| r.item_name == "item 0"));
        assert_eq!(summary.last_output, Some(PathBuf::from("batch_1.csv")));
    }

    #[tokio::test]
    async fn cancel_before_start_visits_nothing() {
        let page = FakePage::default();
        let settings = fast_settings();
        let mut sink = MemorySink::default();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let summary = Collector::new(&settings, &page, &mut sink, cancel)
            .run(&items(5))
            .await
            .unwrap();
        assert!(summary.cancelled);
        assert!(page.visited().is_empty());
        assert!(sink.batches.is_empty());
    }

    #[tokio::test]
    async fn writes_real_csv_files() {
        let dir = tempfile::tempdir().unwrap();
        let page = FakePage::default().with("9", ListType::Sell, Ok(vec!["破损不堪¥1,000"]));
        let settings = fast_settings();

        let summary = Collector::new(&settings, &page, CsvReport::new(dir.path()), CancellationToken::new())
            .run(&[ItemDescriptor::new("M9 刺刀", "9", "")])
            .await
            .unwrap();
        let path = summary.last_output.unwrap();
        let body = std::fs::read_to_string(path).unwrap();
        assert!(body.contains("M9 刺刀,普通,破损不堪,1000,,"));
        assert_eq!(body.lines().count(), 6);
    }

    #[test]
    fn pacing_stays_in_window() {
        for _ in 0..200 {
            let d = pacing_delay(1.0, 3.0).as_secs_f64();
            assert!((1.0..=3.0).contains(&d));
        }
        assert_eq!(pacing_delay(0.0, 0.0), Duration::ZERO);
        assert_eq!(pacing_delay(2.0, 2.0), Duration::from_secs(2));
    }
}
