//! Typed calls for the service's built-in commands.

use serde::Deserialize;

use crate::client::Client;
use crate::error::{LuciError, Result};
use crate::protocol::{Header, Message, Value};
use crate::transport::Connector;

/// Geographic reference of a scenario.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct GeoRef {
    #[serde(default)]
    pub lat: f64,
    #[serde(default)]
    pub lon: f64,
    #[serde(default)]
    pub alt: f64,
    #[serde(rename = "CRS", default)]
    pub crs: Option<String>,
    #[serde(rename = "UNIT", default)]
    pub unit: Option<String>,
}

/// One entry of the scenario list.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioInfo {
    #[serde(rename = "ScID")]
    pub sc_id: i64,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub last_modified: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub geo_ref: Option<GeoRef>,
}

impl<C: Connector> Client<C> {
    pub async fn authenticate(&self, username: &str, password: &str) -> Result<Message> {
        self.send(
            Header::new()
                .with("run", "authenticate")
                .with("username", username)
                .with("userpasswd", password),
        )
        .await
    }

    /// Register this process as a remote service.
    pub async fn register_service(
        &self,
        service_name: &str,
        description: &str,
        example_call: Header,
        inputs: Option<Header>,
        outputs: Option<Header>,
    ) -> Result<Message> {
        let mut header = Header::new()
            .with("run", "RemoteRegister")
            .with("serviceName", service_name)
            .with("description", description)
            .with("exampleCall", example_call);
        if let Some(inputs) = inputs {
            header.insert("inputs", inputs);
        }
        if let Some(outputs) = outputs {
            header.insert("outputs", outputs);
        }
        self.send(header).await
    }

    /// Fetch a scenario as GeoJSON. `options` are sent alongside `run` and `ScID`.
    pub async fn get_scenario(&self, sc_id: i64, mut options: Header) -> Result<Message> {
        options.insert("run", "scenario.geojson.Get");
        options.insert("ScID", sc_id);
        self.send(options).await
    }

    pub async fn create_scenario(&self, name: &str, geometry: impl Into<Value>) -> Result<Message> {
        self.send(
            Header::new()
                .with("run", "scenario.geojson.Create")
                .with("name", name)
                .with("geometry_input", geometry),
        )
        .await
    }

    pub async fn update_scenario(&self, sc_id: i64, geometry: impl Into<Value>) -> Result<Message> {
        self.send(
            Header::new()
                .with("run", "scenario.geojson.Update")
                .with("ScID", sc_id)
                .with("geometry_input", geometry),
        )
        .await
    }

    /// Names of all registered services.
    pub async fn service_list(&self) -> Result<Vec<String>> {
        let answer = self
            .send(Header::new().with("run", "ServiceList"))
            .await?
            .into_result()?;

        let names = result_field(&answer, "serviceNames")?
            .as_array()
            .ok_or_else(|| LuciError::Protocol("serviceNames is not an array".to_string()))?;

        Ok(names
            .iter()
            .map(|name| match name {
                Value::String(s) => s.clone(),
                other => other.to_json(None).to_string(),
            })
            .collect())
    }

    pub async fn scenario_list(&self) -> Result<Vec<ScenarioInfo>> {
        let answer = self
            .send(Header::new().with("run", "scenario.GetList"))
            .await?
            .into_result()?;

        let scenarios = result_field(&answer, "scenarios")?.to_json(Some(answer.attachment_store()));
        Ok(serde_json::from_value(scenarios)?)
    }
}

fn result_field<'a>(answer: &'a Message, key: &str) -> Result<&'a Value> {
    answer
        .result()
        .and_then(|result| result.get(key))
        .ok_or_else(|| LuciError::Protocol(format!("result has no {key}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scenario_info_from_service_json() {
        let json = serde_json::json!([
            {
                "ScID": 3,
                "createdAt": 1500000000,
                "lastModified": 1500000100,
                "name": "district",
                "geoRef": { "lat": 47.4, "lon": 8.5, "alt": 0.0, "CRS": "EPSG:4326", "UNIT": "m" }
            },
            { "ScID": 4, "name": "empty" }
        ]);

        let list: Vec<ScenarioInfo> = serde_json::from_value(json).unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].sc_id, 3);
        assert_eq!(list[0].last_modified, 1500000100);
        let geo = list[0].geo_ref.as_ref().unwrap();
        assert_eq!(geo.crs.as_deref(), Some("EPSG:4326"));
        assert_eq!(geo.unit.as_deref(), Some("m"));
        assert!(list[1].geo_ref.is_none());
        assert_eq!(list[1].created_at, 0);
    }

    #[test]
    fn test_result_field_missing() {
        let answer = Message::new(Header::new().with("result", Header::new()));
        assert!(matches!(
            result_field(&answer, "serviceNames"),
            Err(LuciError::Protocol(_))
        ));
    }
}
