//! Opaque Pass
//!
//! Opaque items front to back, then transmissive items. Transmissive items
//! come last so the transmission target already holds everything behind
//! them.

use super::transparent::draw_sides;
use super::{FrameContext, PassConfig, ViewData, draw_item, material_for};
use crate::renderer::render_list::RenderList;

pub(crate) fn render(
    frame: &mut FrameContext<'_>,
    list: &RenderList,
    view: &ViewData,
    pass: &PassConfig,
) {
    for item in list.opaque() {
        let Some(material) = material_for(frame.scene, item) else {
            continue;
        };
        draw_item(frame, item, material, material.settings().side, view, pass);
    }
    for item in list.transmissive() {
        let Some(material) = material_for(frame.scene, item) else {
            continue;
        };
        for &side in draw_sides(material) {
            draw_item(frame, item, material, side, view, pass);
        }
    }
}
