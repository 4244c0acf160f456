//! Operator identities and their parameters.

use std::fmt;

use pk_kernels::im2col::{conv_output_dim, deconv_output_dim, ConvGeometry};

use crate::error::{OpError, Result};

/// Operators the engine can dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OpKind {
    Conv2d,
    GroupConv2d,
    DepthwiseConv2d,
    Deconv2d,
    FullyConnected,
    MatMul,
    MaxPool2d,
    AvgPool2d,
    GlobalAvgPool2d,
    Add,
    Sub,
    Mul,
    Relu,
}

impl OpKind {
    /// Inclusive range of accepted input counts.
    pub fn arity(&self) -> (usize, usize) {
        match self {
            OpKind::Conv2d
            | OpKind::GroupConv2d
            | OpKind::DepthwiseConv2d
            | OpKind::Deconv2d
            | OpKind::FullyConnected => (2, 3),
            OpKind::MatMul | OpKind::Add | OpKind::Sub | OpKind::Mul => (2, 2),
            OpKind::MaxPool2d | OpKind::AvgPool2d | OpKind::GlobalAvgPool2d | OpKind::Relu => (1, 1),
        }
    }

    pub fn is_binary(&self) -> bool {
        matches!(self, OpKind::Add | OpKind::Sub | OpKind::Mul)
    }

    /// Pick the convolution flavour for a channel/group configuration.
    pub fn classify_conv(groups: usize, in_channels: usize, out_channels: usize) -> OpKind {
        if groups <= 1 {
            OpKind::Conv2d
        } else if groups == in_channels && groups == out_channels {
            OpKind::DepthwiseConv2d
        } else {
            OpKind::GroupConv2d
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OpKind::Conv2d => "conv2d",
            OpKind::GroupConv2d => "group_conv2d",
            OpKind::DepthwiseConv2d => "depthwise_conv2d",
            OpKind::Deconv2d => "deconv2d",
            OpKind::FullyConnected => "fullyconnected",
            OpKind::MatMul => "matmul",
            OpKind::MaxPool2d => "maxpool2d",
            OpKind::AvgPool2d => "avgpool2d",
            OpKind::GlobalAvgPool2d => "global_avgpool2d",
            OpKind::Add => "add",
            OpKind::Sub => "sub",
            OpKind::Mul => "mul",
            OpKind::Relu => "relu",
        };
        f.write_str(name)
    }
}

/// Parameters of 2-D convolution and transposed convolution.
///
/// Convolution weights are `[O, I/groups, kh, kw]`; transposed convolution
/// weights are `[I, O/groups, kh, kw]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Conv2dParams {
    pub kernel_h: usize,
    pub kernel_w: usize,
    pub stride_h: usize,
    pub stride_w: usize,
    pub dilation_h: usize,
    pub dilation_w: usize,
    pub pad_top: usize,
    pub pad_left: usize,
    pub pad_down: usize,
    pub pad_right: usize,
    pub groups: usize,
    /// Extra rows/columns appended to a transposed convolution's output.
    pub output_pad_h: usize,
    pub output_pad_w: usize,
}

impl Conv2dParams {
    /// Square kernel, unit stride and dilation, no padding, one group.
    pub fn new(kernel_h: usize, kernel_w: usize) -> Self {
        Conv2dParams {
            kernel_h,
            kernel_w,
            stride_h: 1,
            stride_w: 1,
            dilation_h: 1,
            dilation_w: 1,
            pad_top: 0,
            pad_left: 0,
            pad_down: 0,
            pad_right: 0,
            groups: 1,
            output_pad_h: 0,
            output_pad_w: 0,
        }
    }

    pub fn with_stride(mut self, stride_h: usize, stride_w: usize) -> Self {
        self.stride_h = stride_h;
        self.stride_w = stride_w;
        self
    }

    pub fn with_dilation(mut self, dilation_h: usize, dilation_w: usize) -> Self {
        self.dilation_h = dilation_h;
        self.dilation_w = dilation_w;
        self
    }

    /// Symmetric padding on all four borders.
    pub fn with_pad(self, pad: usize) -> Self {
        self.with_pads(pad, pad, pad, pad)
    }

    pub fn with_pads(mut self, top: usize, left: usize, down: usize, right: usize) -> Self {
        self.pad_top = top;
        self.pad_left = left;
        self.pad_down = down;
        self.pad_right = right;
        self
    }

    pub fn with_groups(mut self, groups: usize) -> Self {
        self.groups = groups;
        self
    }

    pub fn with_output_pad(mut self, h: usize, w: usize) -> Self {
        self.output_pad_h = h;
        self.output_pad_w = w;
        self
    }

    pub fn is_dilated(&self) -> bool {
        self.dilation_h > 1 || self.dilation_w > 1
    }

    /// Kernel, stride, dilation and padding with zero extents.
    fn window(&self) -> ConvGeometry {
        ConvGeometry {
            kernel_h: self.kernel_h,
            kernel_w: self.kernel_w,
            stride_h: self.stride_h,
            stride_w: self.stride_w,
            dilation_h: self.dilation_h,
            dilation_w: self.dilation_w,
            pad_top: self.pad_top,
            pad_left: self.pad_left,
            pad_down: self.pad_down,
            pad_right: self.pad_right,
            ..ConvGeometry::default()
        }
    }

    /// Forward convolution geometry for an `in_h × in_w` input.
    pub fn geometry(&self, in_h: usize, in_w: usize) -> Option<ConvGeometry> {
        let out_h = conv_output_dim(
            in_h,
            self.kernel_h,
            self.stride_h,
            self.dilation_h,
            self.pad_top,
            self.pad_down,
        )?;
        let out_w = conv_output_dim(
            in_w,
            self.kernel_w,
            self.stride_w,
            self.dilation_w,
            self.pad_left,
            self.pad_right,
        )?;
        Some(ConvGeometry {
            in_h,
            in_w,
            out_h,
            out_w,
            ..self.window()
        })
    }

    /// Geometry of the forward convolution matching a transposed
    /// convolution of an `in_h × in_w` input: its `in_*` is the transposed
    /// output and its `out_*` the transposed input.
    pub fn deconv_geometry(&self, in_h: usize, in_w: usize) -> Option<ConvGeometry> {
        let out_h = deconv_output_dim(
            in_h,
            self.kernel_h,
            self.stride_h,
            self.dilation_h,
            self.pad_top,
            self.pad_down,
            self.output_pad_h,
        )?;
        let out_w = deconv_output_dim(
            in_w,
            self.kernel_w,
            self.stride_w,
            self.dilation_w,
            self.pad_left,
            self.pad_right,
            self.output_pad_w,
        )?;
        Some(ConvGeometry {
            in_h: out_h,
            in_w: out_w,
            out_h: in_h,
            out_w: in_w,
            ..self.window()
        })
    }
}

/// Parameters of windowed pooling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolParams {
    pub kernel_h: usize,
    pub kernel_w: usize,
    pub stride_h: usize,
    pub stride_w: usize,
    pub pad_top: usize,
    pub pad_left: usize,
    pub pad_down: usize,
    pub pad_right: usize,
    /// Average pooling divides by the full window, padding included.
    pub count_include_pad: bool,
}

impl PoolParams {
    pub fn new(kernel: usize, stride: usize) -> Self {
        PoolParams {
            kernel_h: kernel,
            kernel_w: kernel,
            stride_h: stride,
            stride_w: stride,
            pad_top: 0,
            pad_left: 0,
            pad_down: 0,
            pad_right: 0,
            count_include_pad: false,
        }
    }

    pub fn with_pad(mut self, pad: usize) -> Self {
        self.pad_top = pad;
        self.pad_left = pad;
        self.pad_down = pad;
        self.pad_right = pad;
        self
    }

    pub fn with_count_include_pad(mut self, include: bool) -> Self {
        self.count_include_pad = include;
        self
    }

    pub fn max_pad(&self) -> usize {
        self.pad_top
            .max(self.pad_left)
            .max(self.pad_down)
            .max(self.pad_right)
    }

    /// Window geometry for an `in_h × in_w` input.
    pub fn geometry(&self, in_h: usize, in_w: usize) -> Option<ConvGeometry> {
        Conv2dParams::new(self.kernel_h, self.kernel_w)
            .with_stride(self.stride_h, self.stride_w)
            .with_pads(self.pad_top, self.pad_left, self.pad_down, self.pad_right)
            .geometry(in_h, in_w)
    }

    /// Window covering a whole `h × w` plane.
    pub fn global(h: usize, w: usize) -> Self {
        PoolParams {
            kernel_h: h,
            kernel_w: w,
            stride_h: 1,
            stride_w: 1,
            ..PoolParams::new(1, 1)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MatMulParams {
    pub trans_a: bool,
    pub trans_b: bool,
}

/// Parameters attached to a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpParams {
    Conv(Conv2dParams),
    Pool(PoolParams),
    MatMul(MatMulParams),
    None,
}

impl OpParams {
    pub fn conv(&self, op: OpKind) -> Result<&Conv2dParams> {
        match self {
            OpParams::Conv(p) => Ok(p),
            _ => Err(OpError::invalid(op, "expected convolution parameters")),
        }
    }

    pub fn pool(&self, op: OpKind) -> Result<&PoolParams> {
        match self {
            OpParams::Pool(p) => Ok(p),
            _ => Err(OpError::invalid(op, "expected pooling parameters")),
        }
    }

    /// Matmul flags; absent parameters mean no transposes.
    pub fn matmul(&self) -> MatMulParams {
        match self {
            OpParams::MatMul(p) => *p,
            _ => MatMulParams::default(),
        }
    }
}

impl From<Conv2dParams> for OpParams {
    fn from(p: Conv2dParams) -> Self {
        OpParams::Conv(p)
    }
}

impl From<PoolParams> for OpParams {
    fn from(p: PoolParams) -> Self {
        OpParams::Pool(p)
    }
}

impl From<MatMulParams> for OpParams {
    fn from(p: MatMulParams) -> Self {
        OpParams::MatMul(p)
    }
}
