use vulkanalia::prelude::v1_0::*;

/// Fixed-function state folded into the pipeline cache key.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct RasterState {
    pub cull_mode: vk::CullModeFlags,
    pub front_face: vk::FrontFace,
    pub polygon_mode: vk::PolygonMode,
    pub depth_test_enable: bool,
    pub depth_write_enable: bool,
    pub depth_compare_op: vk::CompareOp,
    pub blend_enable: bool,
    pub src_color_blend_factor: vk::BlendFactor,
    pub dst_color_blend_factor: vk::BlendFactor,
    pub color_blend_op: vk::BlendOp,
    pub src_alpha_blend_factor: vk::BlendFactor,
    pub dst_alpha_blend_factor: vk::BlendFactor,
    pub alpha_blend_op: vk::BlendOp,
    pub color_write_mask: vk::ColorComponentFlags,
    pub rasterization_samples: vk::SampleCountFlags,
    pub alpha_to_coverage: bool,
}

impl Default for RasterState {
    fn default() -> Self {
        Self {
            cull_mode: vk::CullModeFlags::BACK,
            front_face: vk::FrontFace::COUNTER_CLOCKWISE,
            polygon_mode: vk::PolygonMode::FILL,
            depth_test_enable: true,
            depth_write_enable: true,
            depth_compare_op: vk::CompareOp::LESS,
            blend_enable: false,
            src_color_blend_factor: vk::BlendFactor::ONE,
            dst_color_blend_factor: vk::BlendFactor::ZERO,
            color_blend_op: vk::BlendOp::ADD,
            src_alpha_blend_factor: vk::BlendFactor::ONE,
            dst_alpha_blend_factor: vk::BlendFactor::ZERO,
            alpha_blend_op: vk::BlendOp::ADD,
            color_write_mask: vk::ColorComponentFlags::all(),
            rasterization_samples: vk::SampleCountFlags::_1,
            alpha_to_coverage: false,
        }
    }
}

impl RasterState {
    /// Premultiplied-alpha blending on top of `self`.
    pub fn blended(self) -> Self {
        Self {
            blend_enable: true,
            src_color_blend_factor: vk::BlendFactor::ONE,
            dst_color_blend_factor: vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
            src_alpha_blend_factor: vk::BlendFactor::ONE,
            dst_alpha_blend_factor: vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
            depth_write_enable: false,
            ..self
        }
    }

    pub fn rasterization_info(&self) -> vk::PipelineRasterizationStateCreateInfo {
        vk::PipelineRasterizationStateCreateInfo::builder()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(self.polygon_mode)
            .line_width(1.0)
            .cull_mode(self.cull_mode)
            .front_face(self.front_face)
            .depth_bias_enable(false)
            .build()
    }

    pub fn blend_attachment(&self) -> vk::PipelineColorBlendAttachmentState {
        vk::PipelineColorBlendAttachmentState::builder()
            .color_write_mask(self.color_write_mask)
            .blend_enable(self.blend_enable)
            .src_color_blend_factor(self.src_color_blend_factor)
            .dst_color_blend_factor(self.dst_color_blend_factor)
            .color_blend_op(self.color_blend_op)
            .src_alpha_blend_factor(self.src_alpha_blend_factor)
            .dst_alpha_blend_factor(self.dst_alpha_blend_factor)
            .alpha_blend_op(self.alpha_blend_op)
            .build()
    }
}

/// What an external pipeline cache needs to find or build a pipeline.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct PipelineKey {
    /// Opaque id of the shader program, owned by the caller.
    pub program: u64,
    pub render_pass: vk::RenderPass,
    pub subpass: u32,
    pub raster: RasterState,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use vulkanalia::vk::Handle;

    #[test]
    fn keys_differ_by_every_component() {
        let base = PipelineKey {
            program: 1,
            render_pass: vk::RenderPass::from_raw(10),
            subpass: 0,
            raster: RasterState::default(),
        };
        let keys = [
            base,
            PipelineKey { program: 2, ..base },
            PipelineKey {
                render_pass: vk::RenderPass::from_raw(11),
                ..base
            },
            PipelineKey { subpass: 1, ..base },
            PipelineKey {
                raster: RasterState::default().blended(),
                ..base
            },
        ];
        let unique = keys.iter().collect::<HashSet<_>>();
        assert_eq!(unique.len(), keys.len());
    }

    #[test]
    fn create_infos_mirror_state() {
        let state = RasterState {
            cull_mode: vk::CullModeFlags::NONE,
            ..RasterState::default().blended()
        };
        assert_eq!(state.rasterization_info().cull_mode, vk::CullModeFlags::NONE);
        assert_eq!(state.blend_attachment().blend_enable, vk::TRUE);
        assert_eq!(
            state.blend_attachment().dst_color_blend_factor,
            vk::BlendFactor::ONE_MINUS_SRC_ALPHA
        );
        assert_eq!(
            state.rasterization_info().polygon_mode,
            vk::PolygonMode::FILL
        );
    }
}
