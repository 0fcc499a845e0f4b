use crate::engine::Engine;
use crate::error::Result;
use crate::scheduler::RunState;

/// Render the two-panel status badge: job name on grey, status token on
/// green or red. Panel widths are an empirical approximation of rendered
/// text width.
pub fn render(job: &str, status: &str, success: bool) -> String {
    let job_width = job.len() * 7 + 10;
    let status_width = status.len() * 7 + 10;
    let total = job_width + status_width;
    let (gradient1, gradient2) = if success {
        ("#2aff4d", "#24b43c")
    } else {
        ("#ff2a2a", "#b42424")
    };
    format!(
        r##"<svg xmlns="http://www.w3.org/2000/svg" width="{total}" height="20">
  <clipPath id="clip">
    <rect width="{total}" height="20" rx="4"/>
  </clipPath>
  <linearGradient id="job" x1="0" x2="0" y1="0" y2="1">
    <stop offset="0" stop-color="#666" />
    <stop offset="1" stop-color="#333" />
  </linearGradient>
  <linearGradient id="status" x1="0" x2="0" y1="0" y2="1">
    <stop offset="0" stop-color="{gradient1}" />
    <stop offset="1" stop-color="{gradient2}" />
  </linearGradient>
  <g clip-path="url(#clip)" font-family="DejaVu Sans,Verdana,sans-serif" font-size="12" text-anchor="middle">
    <rect width="{job_width}" height="20" fill="url(#job)"/>
    <text x="{job_text_x}" y="14" fill="#fff">{job}</text>
    <rect x="{job_width}" width="{status_width}" height="20" fill="url(#status)"/>
    <text x="{status_text_x}" y="14" fill="#000">{status}</text>
  </g>
</svg>"##,
        job_text_x = job_width / 2 + 1,
        status_text_x = job_width + status_width / 2,
    )
}

impl Engine {
    /// Badge for the most recent completed result of a job, or None when the
    /// job has no completed history.
    pub async fn handle_badge_request(&self, job: &str) -> Result<Option<String>> {
        let Some(code) = self.db.latest_completed_result(job).await? else {
            return Ok(None);
        };
        let state = RunState::from_code(code);
        if state == RunState::Unknown {
            return Ok(None);
        }
        Ok(Some(render(
            job,
            &state.to_string(),
            state == RunState::Success,
        )))
    }
}
