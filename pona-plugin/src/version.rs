use crate::response::{Response, VersionResponse};
use crate::types::Input;
use crate::{CNI_VERSION, Error, SUPPORTED_CNI_VERSION};

pub fn version() -> Response {
    Response::Version(VersionResponse {
        cni_version: CNI_VERSION,
        supported_versions: SUPPORTED_CNI_VERSION.to_vec(),
    })
}

/// Rejects configurations written for a CNI version pona does not speak.
pub fn ensure_supported(input: &Input) -> Result<(), Error> {
    if SUPPORTED_CNI_VERSION.contains(&input.cni_version) {
        Ok(())
    } else {
        Err(Error::IncompatibleVersion(input.cni_version.clone()))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_ensure_supported() {
        let input = Input::parse(br#"{"cniVersion":"0.4.0"}"#).unwrap();
        assert!(ensure_supported(&input).is_ok());
        let input = Input::parse(br#"{"cniVersion":"0.2.0"}"#).unwrap();
        assert!(matches!(
            ensure_supported(&input),
            Err(Error::IncompatibleVersion(_))
        ));
    }

    #[test]
    fn test_version_lists_supported() {
        let Response::Version(resp) = version() else {
            panic!("expected version response");
        };
        let out: serde_json::Value = serde_json::to_value(&resp).unwrap();
        assert_eq!(out["cniVersion"], "1.0.0");
        assert_eq!(
            out["supportedVersions"],
            serde_json::json!(["0.3.1", "0.4.0", "1.0.0"])
        );
    }
}
