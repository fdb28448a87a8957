use crate::error::FetchError;
use crate::model::SensorDescriptor;
use crate::time::{format_window_param, SensorZone};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::time::Duration;

const DEFAULT_REPORT_PATH: &str = "/dataloader.cgi?dw=vcalogcsv&time_start={start}&time_end={end}";

/// Time range requested from every sensor in a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl ReportWindow {
    pub fn ending_at(now: DateTime<Utc>, lookback: ChronoDuration) -> Self {
        Self {
            start: now - lookback,
            end: now,
        }
    }
}

#[async_trait]
pub trait ReportSource: Send + Sync {
    async fn fetch_report(
        &self,
        sensor: &SensorDescriptor,
        zone: &SensorZone,
        window: &ReportWindow,
    ) -> Result<String, FetchError>;
}

/// Builds the report URL with the window rendered in the sensor's local time.
pub fn report_url(
    sensor: &SensorDescriptor,
    zone: &SensorZone,
    window: &ReportWindow,
) -> Result<String, FetchError> {
    let host = sensor.address.host.trim().trim_end_matches('/');
    if host.is_empty() {
        return Err(FetchError::Misconfigured("missing host".to_string()));
    }
    let template = sensor
        .address
        .path_template
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or(DEFAULT_REPORT_PATH);
    let path = template
        .replace("{start}", &format_window_param(zone, window.start))
        .replace("{end}", &format_window_param(zone, window.end));
    let path = if path.starts_with('/') {
        path
    } else {
        format!("/{path}")
    };

    let base = if host.starts_with("http://") || host.starts_with("https://") {
        host.to_string()
    } else {
        format!("http://{host}")
    };
    Ok(format!("{base}:{}{path}", sensor.address.port))
}

#[derive(Clone)]
pub struct HttpReportFetcher {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpReportFetcher {
    pub fn new(client: reqwest::Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    fn classify(&self, err: reqwest::Error) -> FetchError {
        if err.is_timeout() {
            FetchError::Timeout(self.timeout)
        } else if err.is_connect() || err.is_request() {
            FetchError::Unreachable(err.to_string())
        } else {
            FetchError::Body(err.to_string())
        }
    }
}

#[async_trait]
impl ReportSource for HttpReportFetcher {
    async fn fetch_report(
        &self,
        sensor: &SensorDescriptor,
        zone: &SensorZone,
        window: &ReportWindow,
    ) -> Result<String, FetchError> {
        let credentials = sensor
            .credentials
            .as_ref()
            .ok_or_else(|| FetchError::Misconfigured("missing credentials".to_string()))?;
        let url = report_url(sensor, zone, window)?;

        tracing::debug!(sensor = %sensor.id, %url, "requesting sensor report");
        let response = self
            .client
            .get(&url)
            .basic_auth(&credentials.username, Some(&credentials.password))
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|err| self.classify(err))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }
        response.text().await.map_err(|err| self.classify(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Ownership, SensorAddress, SensorCredentials};
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::get;
    use axum::Router;
    use chrono::TimeZone;
    use uuid::Uuid;

    fn sensor(host: &str, port: u16, template: Option<&str>) -> SensorDescriptor {
        SensorDescriptor {
            id: "s1".to_string(),
            owner: Ownership {
                store_id: Uuid::nil(),
                organization_id: Uuid::nil(),
            },
            address: SensorAddress {
                host: host.to_string(),
                port,
                path_template: template.map(str::to_string),
            },
            credentials: Some(SensorCredentials {
                username: "admin".to_string(),
                password: "secret".to_string(),
            }),
            active: true,
            timezone: None,
            last_seen: None,
        }
    }

    fn window() -> ReportWindow {
        ReportWindow::ending_at(
            Utc.with_ymd_and_hms(2024, 1, 15, 3, 0, 0).unwrap(),
            ChronoDuration::hours(2),
        )
    }

    #[test]
    fn default_template_carries_local_window() {
        let zone = SensorZone::parse("+09:00").unwrap();
        let url = report_url(&sensor("10.0.0.5", 8080, None), &zone, &window()).unwrap();
        assert_eq!(
            url,
            "http://10.0.0.5:8080/dataloader.cgi?dw=vcalogcsv&time_start=2024-01-15-10:00:00&time_end=2024-01-15-12:00:00"
        );
    }

    #[test]
    fn custom_template_and_scheme_are_kept() {
        let url = report_url(
            &sensor("https://cam.local/", 443, Some("export?from={start}&to={end}")),
            &SensorZone::default(),
            &window(),
        )
        .unwrap();
        assert_eq!(
            url,
            "https://cam.local:443/export?from=2024-01-15-01:00:00&to=2024-01-15-03:00:00"
        );
    }

    #[test]
    fn blank_host_is_misconfigured() {
        let err = report_url(&sensor("  ", 80, None), &SensorZone::default(), &window()).unwrap_err();
        assert!(matches!(err, FetchError::Misconfigured(_)));
    }

    async fn serve(app: Router) -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        port
    }

    #[tokio::test]
    async fn sends_basic_auth_and_returns_body() {
        let app = Router::new().route(
            "/dataloader.cgi",
            get(|headers: HeaderMap| async move {
                match headers.get("authorization").and_then(|v| v.to_str().ok()) {
                    // admin:secret
                    Some("Basic YWRtaW46c2VjcmV0") => (StatusCode::OK, "header\n".to_string()),
                    _ => (StatusCode::UNAUTHORIZED, String::new()),
                }
            }),
        );
        let port = serve(app).await;
        let fetcher = HttpReportFetcher::new(reqwest::Client::new(), Duration::from_secs(5));
        let body = fetcher
            .fetch_report(&sensor("127.0.0.1", port, None), &SensorZone::default(), &window())
            .await
            .unwrap();
        assert_eq!(body, "header\n");
    }

    #[tokio::test]
    async fn non_success_status_is_typed() {
        let app = Router::new().route(
            "/dataloader.cgi",
            get(|| async { (StatusCode::SERVICE_UNAVAILABLE, "busy") }),
        );
        let port = serve(app).await;
        let fetcher = HttpReportFetcher::new(reqwest::Client::new(), Duration::from_secs(5));
        let err = fetcher
            .fetch_report(&sensor("127.0.0.1", port, None), &SensorZone::default(), &window())
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Status(503)));
    }

    #[tokio::test]
    async fn slow_sensor_times_out() {
        let app = Router::new().route(
            "/dataloader.cgi",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                "late"
            }),
        );
        let port = serve(app).await;
        let fetcher = HttpReportFetcher::new(reqwest::Client::new(), Duration::from_millis(150));
        let err = fetcher
            .fetch_report(&sensor("127.0.0.1", port, None), &SensorZone::default(), &window())
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Timeout(_)));
    }

    #[tokio::test]
    async fn missing_credentials_never_hit_the_network() {
        let mut target = sensor("127.0.0.1", 9, None);
        target.credentials = None;
        let fetcher = HttpReportFetcher::new(reqwest::Client::new(), Duration::from_secs(1));
        let err = fetcher
            .fetch_report(&target, &SensorZone::default(), &window())
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Misconfigured(_)));
    }
}
