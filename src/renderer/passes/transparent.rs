//! Transparent Pass
//!
//! Blended items, back to front. A double-sided transparent material that
//! does not force a single pass is drawn twice: back faces, then front faces,
//! so its far side blends under its near side.

use super::{FrameContext, PassConfig, ViewData, draw_item, material_for};
use crate::renderer::render_list::RenderList;
use crate::resources::{Material, Side};

const TWO_PASS: [Side; 2] = [Side::Back, Side::Front];

/// Sides `material` is drawn with, in order.
pub(crate) fn draw_sides(material: &Material) -> &'static [Side] {
    let settings = material.settings();
    if settings.transparent && settings.side == Side::Double && !settings.force_single_pass {
        return &TWO_PASS;
    }
    match settings.side {
        Side::Front => &[Side::Front],
        Side::Back => &[Side::Back],
        Side::Double => &[Side::Double],
    }
}

pub(crate) fn render(
    frame: &mut FrameContext<'_>,
    list: &RenderList,
    view: &ViewData,
    pass: &PassConfig,
) {
    for item in list.transparent() {
        let Some(material) = material_for(frame.scene, item) else {
            continue;
        };
        for &side in draw_sides(material) {
            draw_item(frame, item, material, side, view, pass);
        }
    }
}

#[cfg(test)]
mod tests {
    use glam::Vec3;

    use super::*;
    use crate::resources::MaterialKind;

    #[test]
    fn double_sided_transparency_draws_back_then_front() {
        let mut material = Material::new(MaterialKind::basic(Vec3::ONE));
        material.settings_mut().side = Side::Double;
        assert_eq!(draw_sides(&material), &[Side::Double]);

        material.settings_mut().transparent = true;
        assert_eq!(draw_sides(&material), &[Side::Back, Side::Front]);

        material.settings_mut().force_single_pass = true;
        assert_eq!(draw_sides(&material), &[Side::Double]);
    }
}
