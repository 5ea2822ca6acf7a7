use tokio_util::sync::CancellationToken;

use crate::filter::{Filter, FilterResult, HeaderMutationWriter, RequestContext, SameSite};

/// Rewrites every response cookie to `SameSite=Lax; HttpOnly`.
#[derive(Clone, Debug, Default)]
pub struct SameSiteLax;

#[async_trait::async_trait]
impl Filter for SameSiteLax {
    fn name(&self) -> &str {
        "same_site_lax"
    }

    async fn on_request_headers(
        &self,
        _cancel: &CancellationToken,
        _writer: &mut HeaderMutationWriter,
        _req: &mut RequestContext,
    ) -> FilterResult {
        Ok(None)
    }

    async fn on_response_headers(
        &self,
        _cancel: &CancellationToken,
        writer: &mut HeaderMutationWriter,
        req: &mut RequestContext,
    ) -> FilterResult {
        for (i, cookie) in req.set_cookies().iter().enumerate() {
            let mut cookie = cookie.clone();
            cookie.same_site = Some(SameSite::Lax);
            cookie.http_only = true;
            // first one replaces the upstream header, the rest are appended
            if i == 0 {
                writer.set_header("set-cookie", &cookie.to_string());
            } else {
                writer.append_header("set-cookie", &cookie.to_string());
            }
        }
        Ok(None)
    }
}
