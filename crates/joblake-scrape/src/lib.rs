//! HTML extraction and the date-bounded pagination crawl.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use joblake_core::{ConfigError, JoinedListing, ListingDetail, ListingSummary};
use joblake_storage::{FetchError, PageFetcher};
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use tracing::info;

pub const CRATE_NAME: &str = "joblake-scrape";

const LISTING_CARD_SELECTOR: &str = ".job-ListItem";
const CARD_TITLE_SELECTOR: &str = ".job-Title";
const CARD_DATE_SELECTOR: &str = ".time-Stamp";
const CARD_LINK_SELECTOR: &str = ".detail-Btn02 a";
const JOB_BOX_ITEM_SELECTOR: &str = ".job-Box ul li";
const TABLE_ROW_SELECTOR: &str = "table tr";

/// Character count of the posted-on label prefix (掲載開始日：).
const DATE_LABEL_PREFIX_CHARS: usize = 6;
const DATE_FORMAT: &str = "%Y年%m月%d日";

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("invalid selector: {0}")]
    Selector(String),
    #[error("listing card missing {part}")]
    CardStructure { part: &'static str },
    #[error("cannot parse listing date {text:?}")]
    Date {
        text: String,
        #[source]
        source: chrono::ParseError,
    },
    #[error("job box has {found} items, expected at least 5")]
    JobBoxArity { found: usize },
    #[error("detail page missing data table")]
    MissingTable,
    #[error("data table row missing th/td cell")]
    TableRowStructure,
    #[error("no digits in salary text {0:?}")]
    Salary(String),
}

#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Parse(#[from] ParseError),
}

fn sel(selector: &str) -> Result<Selector, ParseError> {
    Selector::parse(selector).map_err(|e| ParseError::Selector(e.to_string()))
}

fn element_text(el: ElementRef<'_>) -> String {
    el.text().collect::<String>().trim().to_string()
}

/// Parse one listing-index page into summary rows, one per listing card.
///
/// Title, posted-on stamp and detail link are read together from each card
/// element, so a malformed card fails in place instead of silently shifting
/// the alignment of later rows.
pub fn parse_index_page(html: &str) -> Result<Vec<ListingSummary>, ParseError> {
    let document = Html::parse_document(html);
    let card_sel = sel(LISTING_CARD_SELECTOR)?;
    let title_sel = sel(CARD_TITLE_SELECTOR)?;
    let date_sel = sel(CARD_DATE_SELECTOR)?;
    let link_sel = sel(CARD_LINK_SELECTOR)?;

    let mut rows = Vec::new();
    for card in document.select(&card_sel) {
        rows.push(parse_listing_card(card, &title_sel, &date_sel, &link_sel)?);
    }
    info!(count = rows.len(), "parsed index page");
    Ok(rows)
}

fn parse_listing_card(
    card: ElementRef<'_>,
    title_sel: &Selector,
    date_sel: &Selector,
    link_sel: &Selector,
) -> Result<ListingSummary, ParseError> {
    let job_title = card
        .select(title_sel)
        .next()
        .map(element_text)
        .ok_or(ParseError::CardStructure { part: "title" })?;

    let stamp = card
        .select(date_sel)
        .next()
        .map(element_text)
        .ok_or(ParseError::CardStructure { part: "posted-on stamp" })?;
    let date_text: String = stamp.chars().skip(DATE_LABEL_PREFIX_CHARS).collect();
    let listing_start_date = NaiveDate::parse_from_str(&date_text, DATE_FORMAT)
        .map_err(|source| ParseError::Date {
            text: date_text.clone(),
            source,
        })?;

    let detail_link = card
        .select(link_sel)
        .next()
        .and_then(|a| a.value().attr("href"))
        .map(|href| href.trim().to_string())
        .ok_or(ParseError::CardStructure { part: "detail link" })?;

    Ok(ListingSummary {
        job_title,
        listing_start_date,
        detail_link,
    })
}

/// Parse one detail page: five fixed-position job-box bullets, then the
/// optional fields projected from the page's data table by label.
pub fn parse_detail_page(html: &str) -> Result<ListingDetail, ParseError> {
    let document = Html::parse_document(html);

    let bullets: Vec<String> = document
        .select(&sel(JOB_BOX_ITEM_SELECTOR)?)
        .map(element_text)
        .collect();
    if bullets.len() < 5 {
        return Err(ParseError::JobBoxArity {
            found: bullets.len(),
        });
    }

    let labels = collect_table_rows(&document)?;

    // Static label table; a label absent from the page stays None.
    Ok(ListingDetail {
        monthly_salary: parse_salary(&bullets[0])?,
        occupation: bullets[1].clone(),
        work_type: bullets[2].clone(),
        work_location: bullets[3].clone(),
        industry: bullets[4].clone(),
        job_content: labels.get("案件内容").cloned(),
        required_skills: labels.get("必須スキル").cloned(),
        preferred_skills: labels.get("尚可スキル").cloned(),
        programming_language: labels.get("言語").cloned(),
        tool: labels.get("環境・ツール").cloned(),
        framework: labels.get("フレームワーク・ライブラリ").cloned(),
        rate_of_work: labels.get("稼働率").cloned(),
        number_of_recruitment_interviews: labels.get("面談回数").cloned(),
        number_of_days_worked: labels.get("稼働日数").cloned(),
        number_of_applicants: labels.get("募集人数").cloned(),
    })
}

fn collect_table_rows(document: &Html) -> Result<HashMap<String, String>, ParseError> {
    let row_sel = sel(TABLE_ROW_SELECTOR)?;
    let th_sel = sel("th")?;
    let td_sel = sel("td")?;

    let mut rows = HashMap::new();
    let mut seen_any = false;
    for row in document.select(&row_sel) {
        seen_any = true;
        let th = row
            .select(&th_sel)
            .next()
            .ok_or(ParseError::TableRowStructure)?;
        let td = row
            .select(&td_sel)
            .next()
            .ok_or(ParseError::TableRowStructure)?;
        rows.insert(element_text(th), element_text(td));
    }
    if !seen_any {
        return Err(ParseError::MissingTable);
    }
    Ok(rows)
}

/// Strip every non-digit character and parse the remainder, so
/// `"〜500000円"` becomes `500000`. Full-width digits (０-９) count as
/// digits and are normalized to ASCII.
pub fn parse_salary(text: &str) -> Result<i64, ParseError> {
    let digits: String = text
        .chars()
        .filter_map(|c| match c {
            '0'..='9' => Some(c),
            '０'..='９' => char::from_u32(c as u32 - '０' as u32 + '0' as u32),
            _ => None,
        })
        .collect();
    digits
        .parse()
        .map_err(|_| ParseError::Salary(text.to_string()))
}

/// Fetch abstraction the crawler drives; the production impl is
/// [`PageFetcher`].
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch_text(&self, path_or_url: &str) -> Result<String, FetchError>;
}

#[async_trait]
impl PageSource for PageFetcher {
    async fn fetch_text(&self, path_or_url: &str) -> Result<String, FetchError> {
        PageFetcher::fetch_text(self, path_or_url).await
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CrawlPacing {
    pub page_sleep: Duration,
    pub detail_sleep: Duration,
    /// Runaway guard on the page loop.
    pub max_pages: u32,
}

impl Default for CrawlPacing {
    fn default() -> Self {
        Self {
            page_sleep: Duration::from_secs(5),
            detail_sleep: Duration::from_secs(3),
            max_pages: 100,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScrapeConfig {
    pub base_url: String,
    pub cutoff_date: NaiveDate,
    pub pacing: CrawlPacing,
}

impl ScrapeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let base_url = std::env::var("SCRAPE_BASE_URL")
            .unwrap_or_else(|_| "https://www.bigdata-navi.com".to_string());
        let cutoff_raw =
            std::env::var("SCRAPE_CUTOFF_DATE").unwrap_or_else(|_| "2024-12-27".to_string());
        let cutoff_date = cutoff_raw
            .parse()
            .map_err(|_| ConfigError::InvalidVar {
                name: "SCRAPE_CUTOFF_DATE",
                value: cutoff_raw,
            })?;
        let mut pacing = CrawlPacing::default();
        if let Ok(secs) = std::env::var("SCRAPE_PAGE_SLEEP_SECS") {
            let secs = secs.parse().map_err(|_| ConfigError::InvalidVar {
                name: "SCRAPE_PAGE_SLEEP_SECS",
                value: secs,
            })?;
            pacing.page_sleep = Duration::from_secs(secs);
        }
        if let Ok(secs) = std::env::var("SCRAPE_DETAIL_SLEEP_SECS") {
            let secs = secs.parse().map_err(|_| ConfigError::InvalidVar {
                name: "SCRAPE_DETAIL_SLEEP_SECS",
                value: secs,
            })?;
            pacing.detail_sleep = Duration::from_secs(secs);
        }
        Ok(Self {
            base_url,
            cutoff_date,
            pacing,
        })
    }
}

/// Drives the extractor across successive index pages (newest first),
/// applying the date-based stop rule, then joins each surviving summary
/// with its detail page in original order.
pub struct Crawler<S> {
    source: S,
    pacing: CrawlPacing,
}

impl<S: PageSource> Crawler<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            pacing: CrawlPacing::default(),
        }
    }

    pub fn with_pacing(mut self, pacing: CrawlPacing) -> Self {
        self.pacing = pacing;
        self
    }

    fn index_page_path(page: u32) -> String {
        format!("/item/page/{page}/?sort=new")
    }

    /// Full crawl: any fetch or parse failure aborts the run, no partial
    /// batch is returned.
    pub async fn collect(&self, cutoff: NaiveDate) -> Result<Vec<JoinedListing>, ScrapeError> {
        let summaries = self.collect_summaries(cutoff).await?;
        let total = summaries.len();
        info!(total, "starting detail page scraping");

        let mut joined = Vec::with_capacity(total);
        for (i, summary) in summaries.into_iter().enumerate() {
            info!(n = i + 1, total, link = %summary.detail_link, "scraping detail page");
            let body = self.source.fetch_text(&summary.detail_link).await?;
            let detail = parse_detail_page(&body)?;
            joined.push(JoinedListing::join(summary, detail));
            tokio::time::sleep(self.pacing.detail_sleep).await;
        }
        Ok(joined)
    }

    async fn collect_summaries(
        &self,
        cutoff: NaiveDate,
    ) -> Result<Vec<ListingSummary>, ScrapeError> {
        let mut batch = Vec::new();
        for page in 1..=self.pacing.max_pages {
            let body = self.source.fetch_text(&Self::index_page_path(page)).await?;
            let rows = parse_index_page(&body)?;
            if rows.is_empty() {
                info!(page, "index pages exhausted");
                break;
            }

            let page_min = rows.iter().map(|r| r.listing_start_date).min();
            batch.extend(rows);

            match page_min {
                // The source is sorted newest-first, so every later page is
                // guaranteed older than this one.
                Some(min) if min < cutoff => {
                    info!(page, %min, %cutoff, "reached listings older than cutoff");
                    break;
                }
                _ => {
                    info!(page, %cutoff, "page still within cutoff");
                    tokio::time::sleep(self.pacing.page_sleep).await;
                }
            }
        }

        // The stopping page may carry rows older than the cutoff; drop them.
        batch.retain(|row| row.listing_start_date >= cutoff);
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    fn card(title: &str, date: &str, link: &str) -> String {
        format!(
            r#"<li class="job-ListItem">
                 <p class="job-Title">{title}</p>
                 <p class="time-Stamp">掲載開始日：{date}</p>
                 <div class="detail-Btn02"><a href="{link}">詳細</a></div>
               </li>"#
        )
    }

    fn index_page(cards: &[String]) -> String {
        format!("<html><body><ul>{}</ul></body></html>", cards.join("\n"))
    }

    fn detail_page(salary: &str, extra_rows: &str) -> String {
        format!(
            r#"<html><body>
                 <div class="job-Box"><ul>
                   <li>{salary}</li>
                   <li>データエンジニア</li>
                   <li>業務委託</li>
                   <li>東京都</li>
                   <li>IT</li>
                 </ul></div>
                 <table>
                   <tr><th>案件内容</th><td>分析基盤の構築</td></tr>
                   <tr><th>言語</th><td>Python</td></tr>
                   {extra_rows}
                 </table>
               </body></html>"#
        )
    }

    struct MapSource {
        pages: HashMap<String, String>,
        fetched: Mutex<Vec<String>>,
    }

    impl MapSource {
        fn new(pages: Vec<(String, String)>) -> Self {
            Self {
                pages: pages.into_iter().collect(),
                fetched: Mutex::new(Vec::new()),
            }
        }

        fn fetched(&self) -> Vec<String> {
            self.fetched.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PageSource for MapSource {
        async fn fetch_text(&self, path_or_url: &str) -> Result<String, FetchError> {
            self.fetched.lock().unwrap().push(path_or_url.to_string());
            self.pages
                .get(path_or_url)
                .cloned()
                .ok_or(FetchError::HttpStatus {
                    status: 404,
                    url: path_or_url.to_string(),
                })
        }
    }

    fn zero_pacing() -> CrawlPacing {
        CrawlPacing {
            page_sleep: Duration::ZERO,
            detail_sleep: Duration::ZERO,
            max_pages: 100,
        }
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn index_page_yields_one_row_per_card_in_order() {
        let html = index_page(&[
            card("機械学習エンジニア", "2024年12月28日", "/item/1/"),
            card("データ分析基盤エンジニア", "2024年12月27日", "/item/2/"),
        ]);
        let rows = parse_index_page(&html).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].job_title, "機械学習エンジニア");
        assert_eq!(rows[0].listing_start_date, date(2024, 12, 28));
        assert_eq!(rows[1].detail_link, "/item/2/");
    }

    #[test]
    fn index_card_without_link_is_a_parse_error() {
        let broken = r#"<li class="job-ListItem">
                 <p class="job-Title">壊れたカード</p>
                 <p class="time-Stamp">掲載開始日：2024年12月28日</p>
               </li>"#
            .to_string();
        let html = index_page(&[broken]);
        assert!(matches!(
            parse_index_page(&html),
            Err(ParseError::CardStructure { part: "detail link" })
        ));
    }

    #[test]
    fn unparseable_posted_on_date_is_a_parse_error() {
        let html = index_page(&[card("求人", "近日公開", "/item/1/")]);
        assert!(matches!(parse_index_page(&html), Err(ParseError::Date { .. })));
    }

    #[test]
    fn detail_page_extracts_bullets_and_labels() {
        let html = detail_page(
            "〜800000円",
            "<tr><th>稼働日数</th><td>週5日</td></tr>",
        );
        let detail = parse_detail_page(&html).unwrap();
        assert_eq!(detail.monthly_salary, 800_000);
        assert_eq!(detail.occupation, "データエンジニア");
        assert_eq!(detail.job_content.as_deref(), Some("分析基盤の構築"));
        assert_eq!(detail.programming_language.as_deref(), Some("Python"));
        assert_eq!(detail.number_of_days_worked.as_deref(), Some("週5日"));
    }

    #[test]
    fn absent_optional_labels_stay_none() {
        let detail = parse_detail_page(&detail_page("〜500000円", "")).unwrap();
        assert_eq!(detail.required_skills, None);
        assert_eq!(detail.framework, None);
        assert_eq!(detail.rate_of_work, None);
        assert_eq!(detail.number_of_applicants, None);
    }

    #[test]
    fn salary_strips_non_digits() {
        assert_eq!(parse_salary("〜500000円").unwrap(), 500_000);
        assert_eq!(parse_salary("月給 720,000 円").unwrap(), 720_000);
    }

    #[test]
    fn salary_accepts_full_width_digits() {
        assert_eq!(parse_salary("〜５０００００円").unwrap(), 500_000);
        assert_eq!(parse_salary("月給８０万５000円").unwrap(), 805_000);
    }

    #[test]
    fn digitless_salary_is_a_parse_error() {
        assert!(matches!(parse_salary("応相談"), Err(ParseError::Salary(_))));
    }

    #[tokio::test]
    async fn crawl_stops_at_first_page_older_than_cutoff_and_filters() {
        let cutoff = date(2024, 12, 27);
        let page1 = index_page(&[
            card("求人A", "2024年12月29日", "/item/a/"),
            card("求人B", "2024年12月28日", "/item/b/"),
        ]);
        // Page 2 dips below the cutoff; page 3 must never be requested.
        let page2 = index_page(&[
            card("求人C", "2024年12月27日", "/item/c/"),
            card("求人D", "2024年12月25日", "/item/d/"),
        ]);
        let detail = detail_page("〜600000円", "");
        let source = MapSource::new(vec![
            ("/item/page/1/?sort=new".to_string(), page1),
            ("/item/page/2/?sort=new".to_string(), page2),
            ("/item/a/".to_string(), detail.clone()),
            ("/item/b/".to_string(), detail.clone()),
            ("/item/c/".to_string(), detail.clone()),
        ]);

        let crawler = Crawler::new(source).with_pacing(zero_pacing());
        let joined = crawler.collect(cutoff).await.unwrap();

        let links: Vec<_> = joined.iter().map(|j| j.detail_link.as_str()).collect();
        assert_eq!(links, vec!["/item/a/", "/item/b/", "/item/c/"]);
        assert!(joined.iter().all(|j| j.listing_start_date >= cutoff));

        let fetched = crawler.source.fetched();
        assert!(!fetched.contains(&"/item/page/3/?sort=new".to_string()));
        assert!(!fetched.contains(&"/item/d/".to_string()));
    }

    #[tokio::test]
    async fn empty_first_page_yields_empty_result_without_detail_fetches() {
        let source = MapSource::new(vec![(
            "/item/page/1/?sort=new".to_string(),
            index_page(&[]),
        )]);
        let crawler = Crawler::new(source).with_pacing(zero_pacing());
        let joined = crawler.collect(date(2024, 12, 27)).await.unwrap();
        assert!(joined.is_empty());
        assert_eq!(
            crawler.source.fetched(),
            vec!["/item/page/1/?sort=new".to_string()]
        );
    }

    #[tokio::test]
    async fn detail_fetch_failure_aborts_the_whole_run() {
        let page1 = index_page(&[
            card("求人A", "2024年12月26日", "/item/a/"),
            card("求人B", "2024年12月25日", "/item/missing/"),
        ]);
        let source = MapSource::new(vec![
            ("/item/page/1/?sort=new".to_string(), page1),
            ("/item/a/".to_string(), detail_page("〜600000円", "")),
        ]);
        let crawler = Crawler::new(source).with_pacing(zero_pacing());
        let result = crawler.collect(date(2024, 12, 20)).await;
        assert!(matches!(result, Err(ScrapeError::Fetch(_))));
    }
}
