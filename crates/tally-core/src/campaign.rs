//! Campaign links (universal links, deep links carrying UTM parameters).

use url::Url;

use crate::value::Properties;

/// Query parameters of a campaign link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CampaignData {
    url: Url,
    params: Vec<(String, String)>,
}

impl CampaignData {
    pub fn parse(input: &str) -> Result<Self, url::ParseError> {
        Url::parse(input).map(Self::from_url)
    }

    pub fn from_url(url: Url) -> Self {
        let params = url
            .query_pairs()
            .map(|(name, value)| (name.into_owned(), value.into_owned()))
            .collect();
        Self { url, params }
    }

    pub const fn url(&self) -> &Url {
        &self.url
    }

    /// Every `utm*` query parameter, as deferred attribution for the
    /// session start.
    pub fn utm_properties(&self) -> Properties {
        self.params
            .iter()
            .filter(|(name, _)| name.starts_with("utm"))
            .map(|(name, value)| (name.clone(), value.as_str().into()))
            .collect()
    }

    /// Properties of the `campaign_click` event itself.
    pub fn click_properties(&self, platform: &str) -> Properties {
        Properties::new()
            .insert("url", self.url.as_str())
            .insert("properties", Properties::new().insert("platform", platform))
    }
}
