use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use astro_core::{
    AstroConfig, CacheStats, ConsumerBinding, Delivery, DrainSummary, FetchPipeline,
    HttpTransport, ImageCache, PhotoId, PhotoReference, PipelineStats, SlotId,
    Transport, build_worker_pool,
};
use tokio::runtime::Runtime;
use tracing::{debug, warn};

/// Split `photos` into screens of `slots` entries, at most `limit` of them.
pub fn pages(
    photos: &[PhotoReference],
    slots: usize,
    limit: Option<usize>,
) -> impl Iterator<Item = &[PhotoReference]> {
    photos.chunks(slots.max(1)).take(limit.unwrap_or(usize::MAX))
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum SlotView {
    Image { key: PhotoId, bytes: usize },
    Failed { key: PhotoId, reason: String },
}

impl SlotView {
    fn key(&self) -> PhotoId {
        match self {
            SlotView::Image { key, .. } | SlotView::Failed { key, .. } => *key,
        }
    }
}

/// Owns the worker pool and the consumer side of the pipeline. Lives on the
/// main thread for the whole run.
pub struct Gallery {
    runtime: Runtime,
    pipeline: FetchPipeline,
    binding: ConsumerBinding,
    slots: usize,
    upgrade_to_https: bool,
    shown: BTreeMap<SlotId, SlotView>,
    totals: DrainSummary,
}

impl fmt::Debug for Gallery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gallery")
            .field("slots", &self.slots)
            .field("pipeline", &self.pipeline)
            .field("totals", &self.totals)
            .finish_non_exhaustive()
    }
}

impl Gallery {
    pub fn new(config: &AstroConfig) -> anyhow::Result<Self> {
        let transport = HttpTransport::new(&config.fetch)?;
        Self::with_transport(config, Arc::new(transport))
    }

    pub fn with_transport(
        config: &AstroConfig,
        transport: Arc<dyn Transport>,
    ) -> anyhow::Result<Self> {
        let runtime = build_worker_pool(&config.fetch)?;
        let pipeline =
            FetchPipeline::new(ImageCache::new(), transport, runtime.handle().clone());
        Ok(Self {
            runtime,
            pipeline,
            binding: ConsumerBinding::new(),
            slots: config.gallery.slots,
            upgrade_to_https: config.fetch.upgrade_to_https,
            shown: BTreeMap::new(),
            totals: DrainSummary::default(),
        })
    }

    pub fn pages<'a>(
        &self,
        photos: &'a [PhotoReference],
        limit: Option<usize>,
    ) -> impl Iterator<Item = &'a [PhotoReference]> + use<'a> {
        pages(photos, self.slots, limit)
    }

    /// Bind every slot to the page's photos, then apply deliveries until all
    /// of them have landed or `wait` runs out.
    pub fn show_page(&mut self, page: &[PhotoReference], wait: Duration) -> DrainSummary {
        for (index, photo) in page.iter().enumerate() {
            let url = if self.upgrade_to_https {
                photo.secure_url()
            } else {
                photo.img_src.clone()
            };
            let slot = SlotId(index);
            // A slot moving to another photo shows nothing until that photo lands.
            if self.shown.get(&slot).is_some_and(|view| view.key() != photo.id) {
                self.shown.remove(&slot);
            }
            self.binding.load(&self.pipeline, slot, photo.id, url);
        }
        // A short last page leaves trailing slots empty.
        for index in page.len()..self.slots {
            self.binding.unbind(SlotId(index));
            self.shown.remove(&SlotId(index));
        }

        let deadline = Instant::now() + wait;
        let shown = &mut self.shown;
        let mut apply = |slot: SlotId, key: PhotoId, result: Delivery| {
            let view = match result {
                Ok(bytes) => {
                    debug!(%slot, %key, bytes = bytes.len(), "image shown");
                    SlotView::Image {
                        key,
                        bytes: bytes.len(),
                    }
                }
                Err(err) => {
                    warn!(%slot, %key, error = %err, "image failed");
                    SlotView::Failed {
                        key,
                        reason: err.to_string(),
                    }
                }
            };
            shown.insert(slot, view);
        };

        let mut summary = DrainSummary::default();
        loop {
            let waiting = (0..page.len())
                .any(|index| self.binding.pending_pipeline(SlotId(index)).is_some());
            let remaining = deadline.saturating_duration_since(Instant::now());
            if !waiting || remaining.is_zero() {
                break;
            }
            match self.binding.next_delivery(remaining, &mut apply) {
                Some(applied) => summary += applied,
                None => break,
            }
        }
        summary += self.binding.drain(&mut apply);

        self.totals += summary;
        summary
    }

    /// Cancel whatever is still pending and collect the run's figures.
    pub fn finish(mut self) -> Report {
        let bound: Vec<SlotId> = self.binding.bound_slots().map(|(slot, _)| slot).collect();
        for slot in bound {
            self.binding.unbind(slot);
        }

        let report = Report {
            shown: std::mem::take(&mut self.shown),
            totals: self.totals,
            cache: self.pipeline.cache().stats(),
            pipeline: self.pipeline.stats(),
        };
        self.runtime.shutdown_timeout(Duration::from_secs(1));
        report
    }
}

/// End-of-run summary printed to stdout.
#[derive(Debug)]
pub struct Report {
    shown: BTreeMap<SlotId, SlotView>,
    totals: DrainSummary,
    cache: CacheStats,
    pipeline: PipelineStats,
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (slot, view) in &self.shown {
            let slot = slot.to_string();
            match view {
                SlotView::Image { key, bytes } => {
                    writeln!(f, "{slot:<8} photo {:<10} {bytes} bytes", key.0)?
                }
                SlotView::Failed { key, reason } => {
                    writeln!(f, "{slot:<8} photo {:<10} failed: {reason}", key.0)?
                }
            }
        }
        writeln!(
            f,
            "deliveries: {} applied, {} failed, {} stale",
            self.totals.applied, self.totals.failed, self.totals.stale
        )?;
        writeln!(
            f,
            "cache: {} entries, {} hits, {} misses",
            self.cache.entries, self.cache.hits, self.cache.misses
        )?;
        write!(
            f,
            "fetches: {} started, {} delivered, {} failed, {} cancelled",
            self.pipeline.fetches_started,
            self.pipeline.delivered,
            self.pipeline.failed,
            self.pipeline.cancelled
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use astro_core::FetchError;
    use async_trait::async_trait;
    use bytes::Bytes;
    use tokio_util::sync::CancellationToken;
    use url::Url;

    /// Echoes the path as the body. Refuses plain http; `slow` paths never
    /// answer.
    struct StubTransport;

    #[async_trait]
    impl Transport for StubTransport {
        async fn fetch(
            &self,
            url: &Url,
            _cancel: CancellationToken,
        ) -> Result<Bytes, FetchError> {
            if url.scheme() != "https" {
                return Err(FetchError::transport("plain http refused"));
            }
            if url.path().contains("slow") {
                std::future::pending::<()>().await;
            }
            if url.path().contains("broken") {
                return Err(FetchError::Status {
                    status: 500,
                    url: url.to_string(),
                });
            }
            Ok(Bytes::from(url.path().to_string()))
        }
    }

    fn photo(id: u64, path: &str) -> PhotoReference {
        let url = Url::parse(&format!("http://mars.example/{path}")).expect("valid url");
        PhotoReference::new(id, url)
    }

    fn gallery_with(slots: usize, upgrade_to_https: bool) -> Gallery {
        let mut config = AstroConfig::default();
        config.fetch.worker_threads = 2;
        config.fetch.upgrade_to_https = upgrade_to_https;
        config.gallery.slots = slots;
        Gallery::with_transport(&config, Arc::new(StubTransport)).expect("gallery")
    }

    fn gallery(slots: usize) -> Gallery {
        gallery_with(slots, true)
    }

    #[test]
    fn pages_split_by_slot_count() {
        let photos: Vec<_> = (0..5).map(|id| photo(id, "a.jpg")).collect();
        let sizes: Vec<_> = pages(&photos, 2, None).map(<[_]>::len).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        assert_eq!(pages(&photos, 2, Some(1)).count(), 1);
    }

    #[test]
    fn scrolling_cancels_unfinished_slots() {
        let mut gallery = gallery(2);
        let first = [photo(1, "slow.jpg"), photo(2, "two.jpg")];
        let second = [photo(3, "three.jpg"), photo(4, "four.jpg")];

        let summary = gallery.show_page(&first, Duration::from_millis(200));
        assert_eq!(summary.applied, 1);

        let summary = gallery.show_page(&second, Duration::from_secs(2));
        assert_eq!(summary.applied, 2);

        let report = gallery.finish();
        assert_eq!(report.pipeline.cancelled, 1);
        assert_eq!(
            report.shown.get(&SlotId(0)),
            Some(&SlotView::Image {
                key: PhotoId(3),
                bytes: "/three.jpg".len(),
            })
        );
        assert!(matches!(
            report.shown.get(&SlotId(1)),
            Some(SlotView::Image { key: PhotoId(4), .. })
        ));
    }

    #[test]
    fn rebound_slot_drops_previous_photo_while_waiting() {
        let mut gallery = gallery(1);
        let summary = gallery.show_page(&[photo(1, "one.jpg")], Duration::from_secs(2));
        assert_eq!(summary.applied, 1);
        assert!(matches!(
            gallery.shown.get(&SlotId(0)),
            Some(SlotView::Image { key: PhotoId(1), .. })
        ));

        let summary =
            gallery.show_page(&[photo(2, "slow.jpg")], Duration::from_millis(100));
        assert_eq!(summary.total(), 0);
        assert_eq!(gallery.binding.expected_key(SlotId(0)), Some(PhotoId(2)));
        assert_eq!(gallery.shown.get(&SlotId(0)), None);

        let report = gallery.finish();
        assert!(report.shown.is_empty());
        assert_eq!(report.pipeline.cancelled, 1);
    }

    #[test]
    fn same_photo_on_the_next_page_keeps_its_view() {
        let mut gallery = gallery(1);
        gallery.show_page(&[photo(1, "one.jpg")], Duration::from_secs(2));
        let summary = gallery.show_page(&[photo(1, "one.jpg")], Duration::from_secs(2));

        assert_eq!(summary.applied, 1);
        assert_eq!(gallery.pipeline.stats().cache_hits, 1);
        assert!(matches!(
            gallery.shown.get(&SlotId(0)),
            Some(SlotView::Image { key: PhotoId(1), .. })
        ));
        gallery.finish();
    }

    #[test]
    fn failures_and_short_pages_are_reported() {
        let mut gallery = gallery(3);
        gallery.show_page(
            &[photo(1, "one.jpg"), photo(2, "broken.jpg"), photo(3, "three.jpg")],
            Duration::from_secs(2),
        );
        gallery.show_page(&[photo(4, "four.jpg")], Duration::from_secs(2));

        let report = gallery.finish();
        assert_eq!(report.shown.len(), 1);
        assert_eq!(report.totals.failed, 1);
        assert_eq!(report.totals.applied, 3);

        let text = report.to_string();
        assert!(text.contains("slot-0"));
        assert!(text.contains("deliveries: 3 applied, 1 failed, 0 stale"));
    }

    #[test]
    fn http_links_are_upgraded_before_fetching() {
        let mut gallery = gallery(1);
        let summary = gallery.show_page(&[photo(9, "nine.jpg")], Duration::from_secs(2));
        assert_eq!(summary.applied, 1);
        assert!(gallery.pipeline.cache().contains(&PhotoId(9)));
        gallery.finish();
    }

    #[test]
    fn plain_links_are_fetched_as_given_when_upgrade_is_off() {
        let mut gallery = gallery_with(1, false);
        let summary = gallery.show_page(&[photo(9, "nine.jpg")], Duration::from_secs(2));
        assert_eq!(summary.failed, 1);
        let report = gallery.finish();
        assert!(matches!(
            report.shown.get(&SlotId(0)),
            Some(SlotView::Failed { key: PhotoId(9), .. })
        ));
    }
}
