//! Boot image selection. Snapshot reuse is the dominant latency win,
//! so the most specific image source always takes precedence, and a
//! requested template with no snapshot fails loudly instead of quietly
//! booting an unconfigured base image.

use crate::project::{Fragment, SnapshotBinding};
use crate::sandbox::error::SandboxError;
use crate::sandbox::types::{ImageId, ProviderKind};
use crate::templates::{Environment, TemplateCatalog};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageSource {
    RecoverySnapshot,
    FragmentSnapshot,
    TemplateSnapshot,
    Base,
}

impl ImageSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageSource::RecoverySnapshot => "recovery-snapshot",
            ImageSource::FragmentSnapshot => "fragment-snapshot",
            ImageSource::TemplateSnapshot => "template-snapshot",
            ImageSource::Base => "base",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootImage {
    pub image_id: ImageId,
    pub source: ImageSource,
    /// False when the image already embeds the project files, in which
    /// case restoration after boot must be skipped.
    pub restore_files: bool,
    /// Provider the image lives on. Snapshots only boot on the
    /// provider that took them; `None` means any provider works.
    pub provider: Option<ProviderKind>,
}

/// Everything the decision needs, gathered by the caller.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageQuery<'a> {
    /// Operator-supplied emergency override.
    pub recovery_image_id: Option<&'a str>,
    /// Fragment being brought back, if any.
    pub fragment: Option<&'a Fragment>,
    /// Binding for that fragment's snapshot, for the provider tag.
    pub fragment_binding: Option<&'a SnapshotBinding>,
    pub template: Option<&'a str>,
    pub base_image: Option<&'a str>,
}

/// First match wins: explicit recovery snapshot, then the fragment's
/// own snapshot, then the template snapshot, then the base image.
pub fn select_boot_image(
    query: ImageQuery<'_>,
    catalog: &TemplateCatalog,
    environment: Environment,
) -> Result<BootImage, SandboxError> {
    if let Some(image_id) = query.recovery_image_id {
        tracing::info!(image = %image_id, "Using explicit recovery snapshot");
        return Ok(BootImage {
            image_id: image_id.to_string(),
            source: ImageSource::RecoverySnapshot,
            restore_files: false,
            provider: None,
        });
    }

    if let Some(image_id) = query.fragment.and_then(|f| f.snapshot_image_id.as_deref()) {
        let provider = query
            .fragment_binding
            .filter(|b| b.image_id == image_id)
            .map(|b| b.provider);
        tracing::info!(image = %image_id, "Using fragment snapshot");
        return Ok(BootImage {
            image_id: image_id.to_string(),
            source: ImageSource::FragmentSnapshot,
            restore_files: false,
            provider,
        });
    }

    if let Some(template) = query.template {
        // Template images seed the toolchain, not the project content,
        // so fragment restoration still runs afterwards.
        let image_id = catalog.require(template, environment)?;
        tracing::info!(template = %template, image = %image_id, env = %environment, "Using template snapshot");
        return Ok(BootImage {
            image_id: image_id.to_string(),
            source: ImageSource::TemplateSnapshot,
            restore_files: true,
            provider: None,
        });
    }

    let Some(image_id) = query.base_image else {
        return Err(SandboxError::Config(
            "no template requested and no base image configured".to_string(),
        ));
    };
    tracing::info!(image = %image_id, "Using base image");
    Ok(BootImage {
        image_id: image_id.to_string(),
        source: ImageSource::Base,
        restore_files: true,
        provider: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn fragment_with_snapshot(image_id: &str) -> Fragment {
        let mut fragment = Fragment::new("frag-1");
        fragment.snapshot_image_id = Some(image_id.to_string());
        fragment
    }

    fn binding_for(image_id: &str, provider: ProviderKind) -> SnapshotBinding {
        SnapshotBinding {
            fragment_id: "frag-1".to_string(),
            image_id: image_id.to_string(),
            provider,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn recovery_snapshot_wins_over_everything() {
        let fragment = fragment_with_snapshot("img-frag");
        let selected = select_boot_image(
            ImageQuery {
                recovery_image_id: Some("img-recovery"),
                fragment: Some(&fragment),
                template: Some("vite-react"),
                base_image: Some("img-base"),
                ..Default::default()
            },
            &TemplateCatalog::builtin(),
            Environment::Main,
        )
        .unwrap();
        assert_eq!(selected.source, ImageSource::RecoverySnapshot);
        assert_eq!(selected.image_id, "img-recovery");
        assert!(!selected.restore_files);
    }

    #[test]
    fn fragment_snapshot_beats_template() {
        let fragment = fragment_with_snapshot("img-frag");
        let binding = binding_for("img-frag", ProviderKind::Daytona);
        let selected = select_boot_image(
            ImageQuery {
                fragment: Some(&fragment),
                fragment_binding: Some(&binding),
                template: Some("vite-react"),
                base_image: Some("img-base"),
                ..Default::default()
            },
            &TemplateCatalog::builtin(),
            Environment::Main,
        )
        .unwrap();
        assert_eq!(selected.source, ImageSource::FragmentSnapshot);
        assert_eq!(selected.image_id, "img-frag");
        assert!(!selected.restore_files);
        assert_eq!(selected.provider, Some(ProviderKind::Daytona));
    }

    #[test]
    fn fragment_without_snapshot_falls_to_template() {
        let fragment = Fragment::new("frag-1");
        let selected = select_boot_image(
            ImageQuery {
                fragment: Some(&fragment),
                template: Some("vite-react"),
                base_image: Some("img-base"),
                ..Default::default()
            },
            &TemplateCatalog::builtin(),
            Environment::Dev,
        )
        .unwrap();
        assert_eq!(selected.source, ImageSource::TemplateSnapshot);
        assert_eq!(selected.image_id, "tmpl-vite-react-dev");
        // Template only seeds the toolchain; files still restore.
        assert!(selected.restore_files);
    }

    #[test]
    fn unknown_template_is_fatal_even_with_base_image() {
        let err = select_boot_image(
            ImageQuery {
                template: Some("not-in-catalog"),
                base_image: Some("img-base"),
                ..Default::default()
            },
            &TemplateCatalog::builtin(),
            Environment::Main,
        )
        .unwrap_err();
        assert!(matches!(err, SandboxError::Config(_)));
    }

    #[test]
    fn base_image_only_without_template() {
        let selected = select_boot_image(
            ImageQuery {
                base_image: Some("img-base"),
                ..Default::default()
            },
            &TemplateCatalog::builtin(),
            Environment::Main,
        )
        .unwrap();
        assert_eq!(selected.source, ImageSource::Base);
        assert!(selected.restore_files);
        assert_eq!(selected.provider, None);
    }

    #[test]
    fn nothing_configured_is_fatal() {
        let err = select_boot_image(
            ImageQuery::default(),
            &TemplateCatalog::builtin(),
            Environment::Main,
        )
        .unwrap_err();
        assert!(matches!(err, SandboxError::Config(_)));
    }

    #[test]
    fn stale_binding_does_not_leak_provider() {
        // Binding for a different image than the fragment points at.
        let fragment = fragment_with_snapshot("img-new");
        let binding = binding_for("img-old", ProviderKind::Daytona);
        let selected = select_boot_image(
            ImageQuery {
                fragment: Some(&fragment),
                fragment_binding: Some(&binding),
                ..Default::default()
            },
            &TemplateCatalog::builtin(),
            Environment::Main,
        )
        .unwrap();
        assert_eq!(selected.provider, None);
    }
}
