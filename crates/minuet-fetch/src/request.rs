//! Outbound request description and builder.

use serde::Serialize;

use crate::error::{FetchError, FetchResult};
use crate::url;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMethod {
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Head,
    Options,
}

impl FetchMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            FetchMethod::Get => "GET",
            FetchMethod::Post => "POST",
            FetchMethod::Put => "PUT",
            FetchMethod::Delete => "DELETE",
            FetchMethod::Patch => "PATCH",
            FetchMethod::Head => "HEAD",
            FetchMethod::Options => "OPTIONS",
        }
    }
}

pub struct FetchRequest {
    pub method: FetchMethod,
    pub url: String,
    headers: Vec<(String, String)>,
    query_params: Vec<(String, String)>,
    form_fields: Vec<(String, String)>,
    body: Option<Vec<u8>>,
}

impl FetchRequest {
    pub fn new(method: FetchMethod, url: impl Into<String>) -> Self {
        FetchRequest {
            method,
            url: url.into(),
            headers: Vec::new(),
            query_params: Vec::new(),
            form_fields: Vec::new(),
            body: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(FetchMethod::Get, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(FetchMethod::Post, url)
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn query_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query_params.push((name.into(), value.into()));
        self
    }

    pub fn form_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.form_fields.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Serialize `value` as the JSON body and set the content type.
    pub fn json_body<T: Serialize>(mut self, value: &T) -> FetchResult<Self> {
        let raw = serde_json::to_vec(value).map_err(|e| FetchError::Json(e.to_string()))?;
        self.body = Some(raw);
        self.headers
            .push(("Content-Type".to_string(), "application/json".to_string()));
        Ok(self)
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.headers.iter().any(|(k, _)| k.eq_ignore_ascii_case(name))
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub(crate) fn push_header(&mut self, name: &str, value: &str) {
        self.headers.push((name.to_string(), value.to_string()));
    }

    /// Base URL plus URL-encoded query parameters.
    pub fn final_url(&self) -> String {
        if self.query_params.is_empty() {
            return self.url.clone();
        }
        let mut out = self.url.clone();
        out.push(if self.url.contains('?') { '&' } else { '?' });
        let mut first = true;
        for (name, value) in &self.query_params {
            if !first {
                out.push('&');
            }
            out.push_str(&url::encode_component(name));
            out.push('=');
            out.push_str(&url::encode_component(value));
            first = false;
        }
        out
    }

    /// The wire body: an explicit body wins, otherwise urlencoded form
    /// fields. The optional content type is only applied when the request
    /// set none itself.
    pub(crate) fn wire_body(&self) -> FetchResult<Option<(Vec<u8>, Option<&'static str>)>> {
        if let Some(body) = &self.body {
            return Ok(Some((body.clone(), None)));
        }
        if self.form_fields.is_empty() {
            return Ok(None);
        }
        let encoded = serde_urlencoded::to_string(&self.form_fields)
            .map_err(|e| FetchError::InvalidParam(e.to_string()))?;
        Ok(Some((
            encoded.into_bytes(),
            Some("application/x-www-form-urlencoded"),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn final_url_appends_encoded_params() {
        let req = FetchRequest::get("http://api.test/users")
            .query_param("name", "a b")
            .query_param("lang", "de&en");
        assert_eq!(req.final_url(), "http://api.test/users?name=a%20b&lang=de%26en");
    }

    #[test]
    fn final_url_extends_existing_query() {
        let req = FetchRequest::get("http://api.test/u?x=1").query_param("y", "2");
        assert_eq!(req.final_url(), "http://api.test/u?x=1&y=2");
    }

    #[test]
    fn json_body_sets_content_type() {
        #[derive(Serialize)]
        struct Payload {
            name: &'static str,
        }
        let req = FetchRequest::post("http://api.test/")
            .json_body(&Payload { name: "minuet" })
            .unwrap();
        assert!(req.has_header("content-type"));
        let (body, _) = req.wire_body().unwrap().unwrap();
        assert_eq!(body, br#"{"name":"minuet"}"#);
    }

    #[test]
    fn form_fields_encode_as_urlencoded() {
        let req = FetchRequest::post("http://api.test/")
            .form_field("a", "1")
            .form_field("b", "x y");
        let (body, content_type) = req.wire_body().unwrap().unwrap();
        assert_eq!(body, b"a=1&b=x+y");
        assert_eq!(content_type, Some("application/x-www-form-urlencoded"));
    }

    #[test]
    fn explicit_body_wins_over_form_fields() {
        let req = FetchRequest::post("http://api.test/")
            .form_field("a", "1")
            .body("raw");
        let (body, content_type) = req.wire_body().unwrap().unwrap();
        assert_eq!(body, b"raw");
        assert_eq!(content_type, None);
    }
}
